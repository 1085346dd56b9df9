use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use rpcprims_rpc::RpcConfig;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
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

/// Result of one `call` invocation.
#[derive(Debug, Serialize)]
pub struct CallOutput<'a> {
    pub method: &'a str,
    pub channel: String,
    pub oneway: bool,
    pub reply: Option<String>,
    pub elapsed_us: u128,
}

pub fn print_call(out: &CallOutput<'_>, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["METHOD", "CHANNEL", "REPLY", "ELAPSED"])
                .add_row(vec![
                    out.method.to_string(),
                    out.channel.clone(),
                    out.reply.clone().unwrap_or_else(|| "-".to_string()),
                    format!("{}us", out.elapsed_us),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "method={} channel={} oneway={} reply={} elapsed={}us",
                out.method,
                out.channel,
                out.oneway,
                out.reply.as_deref().unwrap_or("-"),
                out.elapsed_us
            );
        }
        OutputFormat::Raw => {
            if let Some(reply) = &out.reply {
                print_raw(reply.as_bytes());
            }
        }
    }
}

pub fn print_config(config: &RpcConfig, format: OutputFormat) {
    match format {
        OutputFormat::Json | OutputFormat::Raw => {
            println!(
                "{}",
                serde_json::to_string_pretty(config).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SETTING", "VALUE"]);
            for (key, value) in config_rows(config) {
                table.add_row(vec![key.to_string(), value]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for (key, value) in config_rows(config) {
                println!("{key}={value}");
            }
        }
    }
}

fn config_rows(config: &RpcConfig) -> Vec<(&'static str, String)> {
    vec![
        ("threading", format!("{:?}", config.threading).to_lowercase()),
        ("per_channel_lock", config.per_channel_lock.to_string()),
        ("max_servers", config.max_servers.to_string()),
        ("frame.crc", format!("{:?}", config.frame.crc).to_lowercase()),
        ("frame.crc_start", format!("{:#06x}", config.frame.crc_start)),
        (
            "frame.max_idle_retries",
            config.frame.max_idle_retries.to_string(),
        ),
    ]
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}
