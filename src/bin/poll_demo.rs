/// Voltage Poll Demo
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
/// Polls the plant described by a YAML tree and prints every value read.
///
/// Usage: poll_demo [tree.yaml] [seconds]
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::time::sleep;
use voltage_poll::utils::format::format_connection_report;
use voltage_poll::{Channel, ClientListener, ClientOptions, LogCallback, LogLevel, ModbusClient, TreeDescriptor};

struct TickCounter;

impl ClientListener for TickCounter {
    fn on_connect(&self) {
        println!("✅ Client connected");
    }

    fn on_disconnect(&self) {
        println!("⚠️  Client disconnected");
    }

    fn on_tick(&self, elapsed_ms: f32) {
        tracing::trace!("tick after {:.1} ms", elapsed_ms);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut args = std::env::args().skip(1);
    let path = args.next().unwrap_or_else(|| "demos/plant.yaml".to_string());
    let seconds: u64 = match args.next() {
        Some(text) => text.parse::<u64>().context("run time must be a number of seconds")?,
        None => 10,
    };

    println!("🚀 Voltage Poll Demo");
    println!("====================");
    println!("{}", voltage_poll::info());

    let text = std::fs::read_to_string(&path).with_context(|| format!("cannot read {}", path))?;
    let config = TreeDescriptor::from_yaml_str(&text)?.build()?;
    println!(
        "📋 {}: {} connections, {} channels",
        path,
        config.connections().len(),
        config.channels().len()
    );

    config.set_read_channels(Arc::new(|channels: &[Arc<Channel>]| {
        for channel in channels {
            println!("📈 {} = {}", channel.name, channel.read_value());
        }
    }));

    let mut client = ModbusClient::new(ClientOptions::default());
    let console: LogCallback = Box::new(|level, message| match level {
        LogLevel::Error | LogLevel::Warn => tracing::warn!("{}", message),
        _ => tracing::info!("{}", message),
    });
    client.logger().add_source(console);
    client.add_listener(Arc::new(TickCounter));
    client.set_on_danger(Arc::new(|channel: &Arc<Channel>, sound: &str| {
        println!("🚨 {} is dangerous ({}), playing {}", channel.name, channel.read_value(), sound);
    }));

    client.init(config)?;
    client.create()?;
    client.connect(|| println!("🔌 Connecting...")).await?;

    sleep(Duration::from_secs(seconds / 2)).await;
    if client.find_channel("setpoint").is_some() {
        match client.write_channel("setpoint", 65.0) {
            Ok(()) => println!("✏️  setpoint <- 65.0"),
            Err(e) => println!("❌ Failed to write setpoint: {}", e),
        }
    }
    sleep(Duration::from_secs(seconds - seconds / 2)).await;

    println!("\n📊 Connection reports");
    for manager in client.managers() {
        println!(
            "{}",
            format_connection_report(
                &manager.endpoint(),
                &manager.counters(),
                &manager.metrics(),
                &manager.transport_stats()
            )
        );
    }

    client.destroy().await;
    println!("👋 Done");
    Ok(())
}
