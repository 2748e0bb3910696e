//! Chronolog CLI
//!
//! Thin client that talks to the daemon over its Unix socket.
//!
//! Commands:
//! - chronolog insert <json> [--sender ID]
//! - chronolog query [--after MS] [--before MS] [--actor URI] ...
//! - chronolog events <id>...
//! - chronolog blacklist add|remove|list
//! - chronolog daemon status|quit

use anyhow::{bail, Context, Result};
use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};

use chronolog_core::ipc::{IpcClient, IpcMessage, IpcResponse};
use chronolog_core::types::{
    Event, EventPlain, EventTemplate, SubjectTemplate, TimeRange,
};

#[derive(Parser)]
#[command(name = "chronolog")]
#[command(about = "Query and feed the activity log")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Insert events from their JSON plain form
    Insert {
        /// A single event or an array of events
        json: String,

        /// Data-source id to insert as
        #[arg(long, default_value = "")]
        sender: String,
    },

    /// Find events matching a template
    Query {
        /// Lower timestamp bound in ms since the epoch
        #[arg(long, default_value_t = 0)]
        after: i64,

        /// Upper timestamp bound in ms since the epoch
        #[arg(long, default_value_t = i64::MAX)]
        before: i64,

        /// Event interpretation URI
        #[arg(long)]
        interpretation: Option<String>,

        /// Event manifestation URI
        #[arg(long)]
        manifestation: Option<String>,

        /// Actor URI
        #[arg(long)]
        actor: Option<String>,

        /// Subject URI
        #[arg(long)]
        uri: Option<String>,

        /// Subject mimetype
        #[arg(long)]
        mimetype: Option<String>,

        /// Maximum number of events, 0 for unlimited
        #[arg(long, default_value_t = 20)]
        limit: u32,

        /// Sorting, 0-5 (see daemon docs)
        #[arg(long, default_value_t = 0)]
        result_type: u32,

        /// Print ids only
        #[arg(long)]
        ids_only: bool,
    },

    /// Resolve event ids to full events
    Events {
        /// Event ids
        ids: Vec<u64>,
    },

    /// Manage the blacklist
    Blacklist {
        #[command(subcommand)]
        command: BlacklistCommands,
    },

    /// Daemon management
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
}

#[derive(Subcommand)]
enum BlacklistCommands {
    /// Add a template under an id
    Add {
        /// Template id
        id: String,

        /// Event template in JSON plain form
        json: String,
    },

    /// Remove the template under an id
    Remove {
        /// Template id
        id: String,
    },

    /// List all templates
    List,
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Check daemon status
    Status,

    /// Ask the daemon to quit
    Quit,
}

fn parse_events(json: &str) -> Result<Vec<EventPlain>> {
    let plain: Vec<EventPlain> = if json.trim_start().starts_with('[') {
        serde_json::from_str(json).context("Invalid event JSON")?
    } else {
        vec![serde_json::from_str(json).context("Invalid event JSON")?]
    };
    // Validate locally for a readable error before going over the wire.
    for p in &plain {
        Event::from_plain(p)?;
    }
    Ok(plain)
}

fn format_timestamp(timestamp: i64) -> String {
    match Local.timestamp_millis_opt(timestamp) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => timestamp.to_string(),
    }
}

fn print_event(plain: &EventPlain) {
    match Event::from_plain(plain) {
        Ok(event) => {
            println!(
                "#{} {} {} {}",
                event.id,
                format_timestamp(event.timestamp),
                event.interpretation,
                event.actor
            );
            for subject in &event.subjects {
                println!("    {} ({})", subject.uri, subject.mimetype);
            }
        }
        Err(e) => eprintln!("Malformed event in reply: {}", e),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = IpcClient::new();

    match cli.command {
        Commands::Insert { json, sender } => {
            let events = parse_events(&json)?;
            let response = client
                .send(&IpcMessage::InsertEvents { events, sender })
                .context("Failed to talk to the daemon")?;
            match response {
                IpcResponse::EventIds(ids) => {
                    for id in ids {
                        if id == 0 {
                            println!("- (blocked)");
                        } else {
                            println!("{}", id);
                        }
                    }
                }
                other => bail!("Unexpected reply: {:?}", other),
            }
        }

        Commands::Query {
            after,
            before,
            interpretation,
            manifestation,
            actor,
            uri,
            mimetype,
            limit,
            result_type,
            ids_only,
        } => {
            let template = EventTemplate {
                interpretation,
                manifestation,
                actor,
                subjects: if uri.is_some() || mimetype.is_some() {
                    vec![SubjectTemplate {
                        uri,
                        mimetype,
                        ..Default::default()
                    }]
                } else {
                    Vec::new()
                },
                ..Default::default()
            };
            let time_range = TimeRange::new(after, before);
            let templates = vec![template.to_plain()];

            if ids_only {
                let response = client
                    .send(&IpcMessage::FindEventIds {
                        time_range,
                        templates,
                        storage_state: 2,
                        max_events: limit,
                        result_type,
                    })
                    .context("Failed to talk to the daemon")?;
                match response {
                    IpcResponse::EventIds(ids) => {
                        for id in ids {
                            println!("{}", id);
                        }
                    }
                    other => bail!("Unexpected reply: {:?}", other),
                }
            } else {
                let response = client
                    .send(&IpcMessage::FindEvents {
                        time_range,
                        templates,
                        storage_state: 2,
                        max_events: limit,
                        result_type,
                    })
                    .context("Failed to talk to the daemon")?;
                match response {
                    IpcResponse::Events(events) => {
                        if events.is_empty() {
                            println!("No events found");
                        }
                        for event in events.iter().flatten() {
                            print_event(event);
                        }
                    }
                    other => bail!("Unexpected reply: {:?}", other),
                }
            }
        }

        Commands::Events { ids } => {
            let response = client
                .send(&IpcMessage::GetEvents { ids })
                .context("Failed to talk to the daemon")?;
            match response {
                IpcResponse::Events(events) => {
                    for event in &events {
                        match event {
                            Some(plain) => print_event(plain),
                            None => println!("- (unknown id)"),
                        }
                    }
                }
                other => bail!("Unexpected reply: {:?}", other),
            }
        }

        Commands::Blacklist { command } => match command {
            BlacklistCommands::Add { id, json } => {
                let template: EventPlain =
                    serde_json::from_str(&json).context("Invalid template JSON")?;
                EventTemplate::from_plain(&template)?;
                client
                    .send(&IpcMessage::AddTemplate { id, template })
                    .context("Failed to talk to the daemon")?;
                println!("Template added");
            }
            BlacklistCommands::Remove { id } => {
                client
                    .send(&IpcMessage::RemoveTemplate { id })
                    .context("Failed to talk to the daemon")?;
                println!("Template removed");
            }
            BlacklistCommands::List => {
                let response = client
                    .send(&IpcMessage::GetTemplates)
                    .context("Failed to talk to the daemon")?;
                match response {
                    IpcResponse::Templates(templates) => {
                        if templates.is_empty() {
                            println!("Blacklist is empty");
                        }
                        for (id, plain) in templates {
                            println!("{}: {}", id, serde_json::to_string(&plain)?);
                        }
                    }
                    other => bail!("Unexpected reply: {:?}", other),
                }
            }
        },

        Commands::Daemon { command } => match command {
            DaemonCommands::Status => match client.ping() {
                Ok((version, uptime_secs)) => {
                    println!("Daemon: Running");
                    println!("Version: {}", version);
                    println!("Uptime: {}s", uptime_secs);
                }
                Err(_) => {
                    println!("Daemon: Not running");
                    std::process::exit(1);
                }
            },
            DaemonCommands::Quit => {
                if client.daemon_available() {
                    client.quit()?;
                    println!("Daemon stopped");
                } else {
                    println!("Daemon is not running");
                    std::process::exit(1);
                }
            }
        },
    }

    Ok(())
}
