use std::{io::Write, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::ArgMatches;
use serde::Serialize;

use super::{
    cleanup::{register_cleanup, run_cleanups},
    config::BootConfig,
};
use crate::{
    api::Gpib,
    protocol::{DeviceFlags, MAX_GPIB_ADDRESS},
    GpibError,
};

#[derive(Serialize)]
struct ReplyOutput<'a> {
    name: &'a str,
    bytes: usize,
    text: String,
    status: Option<u8>,
}

#[derive(Serialize)]
struct MappingOutput<'a> {
    name: &'a str,
    address: u8,
    flags: u32,
}

#[derive(Serialize)]
struct StatusOutput<'a> {
    name: &'a str,
    status: u8,
}

fn emit<T: Serialize>(
    out: &mut dyn Write,
    json: bool,
    value: &T,
    text: impl FnOnce() -> String,
) -> Result<()> {
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(value)?)?;
    } else {
        let text = text();
        if !text.is_empty() {
            writeln!(out, "{text}")?;
        }
    }
    Ok(())
}

fn device_name(matches: &ArgMatches) -> Result<&str> {
    matches
        .get_one::<String>("name")
        .map(String::as_str)
        .ok_or_else(|| anyhow!("missing device name"))
}

fn option_flags(matches: &ArgMatches) -> Result<Option<DeviceFlags>> {
    let words: Vec<&String> = matches
        .get_many::<String>("options")
        .map(|v| v.collect())
        .unwrap_or_default();
    if words.is_empty() {
        return Ok(None);
    }
    Ok(Some(DeviceFlags::from_options(words)?))
}

fn print_reply(
    out: &mut dyn Write,
    json: bool,
    name: &str,
    data: &[u8],
    status: Option<u8>,
) -> Result<()> {
    let text = String::from_utf8_lossy(data).into_owned();
    let output = ReplyOutput {
        name,
        bytes: data.len(),
        text: text.clone(),
        status,
    };
    emit(out, json, &output, || text.trim_end().to_string())
}

/// Entry point of the binary: load the configuration, run one subcommand
/// against the real adapters, then close everything.
pub fn run(matches: &ArgMatches) -> Result<()> {
    let config = match matches.get_one::<String>("config") {
        Some(path) => BootConfig::from_file(path)?,
        None => BootConfig::default(),
    };
    let gpib = Arc::new(Gpib::with_serial_ports(config.bus.clone()));
    {
        let gpib = Arc::clone(&gpib);
        register_cleanup(move || gpib.close_all());
    }

    let result = run_with(&gpib, &config, matches, &mut std::io::stdout().lock());
    run_cleanups();
    result
}

/// Run the subcommand in `matches` on an existing handle.
pub fn run_with(
    gpib: &Gpib,
    config: &BootConfig,
    matches: &ArgMatches,
    out: &mut dyn Write,
) -> Result<()> {
    config.declare_devices(gpib)?;
    let json = matches.get_flag("json");

    match matches.subcommand() {
        Some(("scan", _)) => {
            let report = gpib.discover()?;
            let controllers = gpib.controllers();
            for rejected in &report.rejected {
                log::info!("{}: {}", rejected.path, rejected.reason);
            }
            emit(out, json, &controllers, || {
                controllers
                    .iter()
                    .map(|c| {
                        format!(
                            "{}\t{}\t{}",
                            c.index,
                            c.port.as_deref().unwrap_or("?"),
                            c.version.as_deref().unwrap_or("")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        }
        Some(("find", sub)) => {
            let begin = sub.get_one::<i64>("begin").copied().unwrap_or(0);
            let end = sub
                .get_one::<i64>("end")
                .copied()
                .unwrap_or(i64::from(MAX_GPIB_ADDRESS));
            let listeners = gpib.find_listeners(begin, end)?;
            emit(out, json, &listeners, || {
                listeners
                    .iter()
                    .map(|l| {
                        format!(
                            "{}\tcontroller {}\tstatus {}",
                            l.address, l.controller, l.status
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        }
        Some(("map", sub)) => {
            let name = device_name(sub)?;
            let mapping = match sub.get_one::<i64>("address") {
                Some(&address) => {
                    let flags = option_flags(sub)?.unwrap_or_default();
                    gpib.declare_mapping(name, address, flags)?
                }
                None => gpib
                    .mapping(name)
                    .ok_or_else(|| GpibError::AddressUnresolved(name.to_string()))?,
            };
            let output = MappingOutput {
                name,
                address: mapping.address,
                flags: mapping.flags.bits(),
            };
            emit(out, json, &output, || {
                format!("{name}\t{}\t{:#x}", mapping.address, mapping.flags.bits())
            })?;
        }
        Some(("links", _)) => {
            for device in &config.devices {
                if let Err(err) = gpib.open(&device.name, DeviceFlags::empty()) {
                    log::warn!("Cannot open \"{}\": {err}", device.name);
                }
            }
            let links = gpib.list_links();
            emit(out, json, &links, || {
                links
                    .iter()
                    .map(|l| {
                        let status = l.status.map_or("-".to_string(), |s| s.to_string());
                        format!("{}\t{}\t{}\t{status}", l.name, l.controller, l.address)
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        }
        Some(("open", sub)) => {
            let name = device_name(sub)?;
            let flags = option_flags(sub)?.unwrap_or(DeviceFlags::empty());
            let link = gpib.open(name, flags)?;
            emit(out, json, &link, || {
                format!("{}\tcontroller {}\taddress {}", link.name, link.controller, link.address)
            })?;
        }
        Some(("status", sub)) => {
            let name = device_name(sub)?;
            let status = gpib.status_byte(name)?;
            emit(out, json, &StatusOutput { name, status }, || status.to_string())?;
        }
        Some((action @ ("remote" | "local" | "clear" | "trigger"), sub)) => {
            let name = device_name(sub)?;
            match action {
                "remote" => gpib.remote(name)?,
                "local" => gpib.local(name)?,
                "clear" => gpib.clear(name)?,
                _ => gpib.trigger(name)?,
            }
        }
        Some(("write", sub)) => {
            let name = device_name(sub)?;
            let parts: Vec<&String> = sub
                .get_many::<String>("data")
                .context("missing data")?
                .collect();
            let base = if sub.get_flag("binary") {
                DeviceFlags::BINARY
            } else {
                DeviceFlags::empty()
            };
            for (i, part) in parts.iter().enumerate() {
                let flags = if i + 1 < parts.len() {
                    base | DeviceFlags::NO_TERMINATOR
                } else {
                    base
                };
                gpib.send(name, part.as_bytes(), flags)?;
            }
            if !sub.get_flag("no-reply") {
                match gpib.buffered_receive(name) {
                    Ok(reply) => print_reply(out, json, name, &reply.data, reply.status)?,
                    Err(GpibError::NoData { .. }) => log::info!("\"{name}\" sent no answer"),
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Some(("read", sub)) => {
            let name = device_name(sub)?;
            let reply = gpib.buffered_receive(name)?;
            print_reply(out, json, name, &reply.data, reply.status)?;
        }
        Some((other, _)) => return Err(anyhow!("unknown command {other}")),
        None => return Err(anyhow!("no command given")),
    }
    Ok(())
}
