//! Bus sniffer for debugging and development
//!
//! Prints every captured frame with its decoded meaning:
//! `[time] IFACE ID [n] BYTES => decoded`

use anyhow::Result;
use chrono::{DateTime, Local};
use colored::*;
use tokio_util::sync::CancellationToken;

use crate::bus::{DecodedEvent, Decoder, Frame, FrameSource};

/// Frame counters shown when the sniffer stops
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SnifferStats {
    pub frames: u64,
    pub decoded: u64,
}

/// Uppercase hex bytes separated by spaces
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// One-line description of a decoded event
pub fn describe_event(event: &DecodedEvent) -> String {
    match event {
        DecodedEvent::LightStatus {
            device_id,
            is_on,
            brightness,
        } => format!(
            "light {} {} {}%",
            device_id,
            if *is_on { "on" } else { "off" },
            brightness
        ),
        DecodedEvent::TankStatus {
            device_id,
            relative_level,
            resolution,
            level,
        } => format!(
            "tank {} {}% (raw {}/{})",
            device_id, level, relative_level, resolution
        ),
        DecodedEvent::WaterDeviceStatus { device_id, is_on } => {
            format!("water {} {}", device_id, if *is_on { "on" } else { "off" })
        }
        DecodedEvent::ClimateRaw { source_id, raw } => {
            format!("climate {} [{}]", source_id, format_hex(raw))
        }
    }
}

fn format_time(timestamp_ms: u64) -> String {
    DateTime::from_timestamp_millis(timestamp_ms as i64)
        .map(|t| t.with_timezone(&Local).format("%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| format!("{}ms", timestamp_ms))
}

fn print_frame(frame: &Frame, event: Option<&DecodedEvent>) {
    let hex = format_hex(&frame.data);
    let (hex_colored, parsed) = match event {
        Some(event) => {
            let hex = match event {
                DecodedEvent::LightStatus { .. } => hex.bright_yellow(),
                DecodedEvent::TankStatus { .. } => hex.bright_cyan(),
                DecodedEvent::WaterDeviceStatus { .. } => hex.bright_green(),
                DecodedEvent::ClimateRaw { .. } => hex.bright_magenta(),
            };
            (hex, format!(" => {}", describe_event(event).bright_blue()))
        }
        None => (hex.bright_black(), String::new()),
    };

    println!(
        "[{}] {:6} {} [{}] {}{}",
        format_time(frame.timestamp_ms).dimmed(),
        frame.interface.white(),
        frame.id_hex().bold(),
        frame.data.len(),
        hex_colored,
        parsed
    );
}

/// Print frames from `source` until it ends or `cancel` fires
pub async fn run_sniffer(
    mut source: Box<dyn FrameSource>,
    decoder: Decoder,
    cancel: CancellationToken,
) -> Result<SnifferStats> {
    println!("{}", "=== Bus Sniffer ===".bold().cyan());
    println!("Source: {}", source.name().bright_white());
    println!("{}", "Format: [time] IFACE ID [n] BYTES => DECODED".dimmed());
    println!("{}\n", "─".repeat(80).dimmed());

    let mut stats = SnifferStats::default();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = source.next_frame() => frame?,
        };
        let Some(frame) = frame else {
            break;
        };

        stats.frames += 1;
        let event = decoder.decode(&frame);
        if event.is_some() {
            stats.decoded += 1;
        }
        print_frame(&frame, event.as_ref());
    }

    println!(
        "\n{} ({} frames, {} decoded)",
        "Sniffer stopped".yellow(),
        stats.frames,
        stats.decoded
    );
    Ok(stats)
}
