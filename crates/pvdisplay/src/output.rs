use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// One line of the demo transcript.
#[derive(Debug, Clone, Serialize)]
pub struct DemoEvent {
    pub actor: &'static str,
    pub event: &'static str,
    pub detail: String,
}

impl DemoEvent {
    pub fn new(actor: &'static str, event: &'static str, detail: impl Into<String>) -> Self {
        Self {
            actor,
            event,
            detail: detail.into(),
        }
    }
}

pub fn print_demo_events(events: &[DemoEvent], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(&events).unwrap_or_else(|_| "[]".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["#", "ACTOR", "EVENT", "DETAIL"]);
            for (i, event) in events.iter().enumerate() {
                table.add_row(vec![
                    i.to_string(),
                    event.actor.to_string(),
                    event.event.to_string(),
                    event.detail.clone(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for event in events {
                println!("[{}] {}: {}", event.actor, event.event, event.detail);
            }
        }
    }
}

#[derive(Serialize)]
pub struct ChecksumOutput {
    pub crc16: String,
    pub bytes: usize,
}

pub fn print_checksum(crc: u16, bytes: usize, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ChecksumOutput {
                crc16: format!("{crc:#06x}"),
                bytes,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_header(vec!["CRC-16", "BYTES"])
                .add_row(vec![format!("{crc:#06x}"), bytes.to_string()]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("crc16={crc:#06x} bytes={bytes}");
        }
    }
}

#[derive(Serialize)]
pub struct VersionOutput {
    pub crate_version: &'static str,
    pub protocol_version: String,
    pub max_packet_size: usize,
}

pub fn print_version(format: OutputFormat) {
    let out = VersionOutput {
        crate_version: env!("CARGO_PKG_VERSION"),
        protocol_version: format!("{:#010x}", pvdisplay_wire::PROTOCOL_VERSION),
        max_packet_size: pvdisplay_wire::MAX_PACKET_SIZE,
    };
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_header(vec!["CRATE", "PROTOCOL", "MAX PACKET"])
                .add_row(vec![
                    out.crate_version.to_string(),
                    out.protocol_version.clone(),
                    out.max_packet_size.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "pvdisplay {} (protocol {}, max packet {} bytes)",
                out.crate_version, out.protocol_version, out.max_packet_size
            );
        }
    }
}
