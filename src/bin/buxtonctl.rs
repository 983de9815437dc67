// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `buxtonctl`: command-line front-end for the configuration store.
//!
//! Runs in one of two modes: over-socket (the default; talks to a running
//! `buxtond` through the client library) or `--direct` (links the storage
//! engine in-process and manipulates the databases without a daemon, for
//! provisioning and recovery).

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use buxton::{
    cfg::config::Config,
    client::connection::ClientConnection,
    store::engine::Store,
    wire::value::{DataType, Value},
};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "buxtonctl", version, about)]
struct Args {
    /// Path to the daemon configuration file.
    #[arg(short, long, default_value = "/etc/buxton/buxtond.yaml")]
    config: PathBuf,

    /// Use the storage engine in-process instead of the daemon socket.
    #[arg(long)]
    direct: bool,

    #[command(subcommand)]
    command: Command,
}

/// Type tag for `set`, `get` and `unset`.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum TypeTag {
    String,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float,
    Double,
    Bool,
    Unset,
}

impl TypeTag {
    fn data_type(self) -> DataType {
        match self {
            TypeTag::String => DataType::String,
            TypeTag::Int32 => DataType::Int32,
            TypeTag::Uint32 => DataType::UInt32,
            TypeTag::Int64 => DataType::Int64,
            TypeTag::Uint64 => DataType::UInt64,
            TypeTag::Float => DataType::Float,
            TypeTag::Double => DataType::Double,
            TypeTag::Bool => DataType::Boolean,
            TypeTag::Unset => DataType::Unset,
        }
    }

    fn parse_value(self, raw: &str) -> Result<Value> {
        Ok(match self {
            TypeTag::String => Value::String(raw.to_owned()),
            TypeTag::Int32 => Value::Int32(raw.parse()?),
            TypeTag::Uint32 => Value::UInt32(raw.parse()?),
            TypeTag::Int64 => Value::Int64(raw.parse()?),
            TypeTag::Uint64 => Value::UInt64(raw.parse()?),
            TypeTag::Float => Value::Float(raw.parse()?),
            TypeTag::Double => Value::Double(raw.parse()?),
            TypeTag::Bool => Value::Boolean(raw.parse()?),
            TypeTag::Unset => bail!("a value needs a concrete type tag"),
        })
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Verify the store is reachable.
    Check,
    /// Create the physical database of a system layer (direct mode only).
    CreateDb { layer: String },
    /// Create a group in a layer.
    CreateGroup { layer: String, group: String },
    /// Remove a group from a layer.
    RemoveGroup { layer: String, group: String },
    /// Read a key, resolving across layers unless one is named.
    Get {
        group: String,
        name: String,
        #[arg(short, long)]
        layer: Option<String>,
        #[arg(short = 't', long = "type", default_value = "unset")]
        ty: TypeTag,
    },
    /// Write a key.
    Set {
        layer: String,
        group: String,
        name: String,
        value: String,
        #[arg(short = 't', long = "type")]
        ty: TypeTag,
    },
    /// Remove a key.
    Unset {
        layer: String,
        group: String,
        name: String,
        #[arg(short = 't', long = "type", default_value = "unset")]
        ty: TypeTag,
    },
    /// Read the privilege string of a group, or of a key when given.
    GetLabel { layer: String, group: String, name: Option<String> },
    /// Write the privilege string of a group, or of a key with --name.
    SetLabel {
        layer: String,
        group: String,
        label: String,
        #[arg(short, long)]
        name: Option<String>,
    },
    /// List group names in a layer, or key names of a group.
    ListNames { layer: String, group: Option<String>, prefix: Option<String> },
}

/// Effective uid of this process, for the direct-mode privilege policy.
/// Fails closed when /proc is unreadable.
fn effective_uid() -> u32 {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return u32::MAX;
    };
    status
        .lines()
        .find_map(|line| {
            let rest = line.strip_prefix("Uid:")?;
            rest.split_whitespace().nth(1)?.parse().ok()
        })
        .unwrap_or(u32::MAX)
}

fn run_direct(cfg: &Config, command: Command) -> Result<()> {
    let mut store = Store::open(cfg).context("opening layer databases")?;

    match command {
        Command::Check => {
            println!("ok: {} layer(s) open", store.layers().len());
        },
        Command::CreateDb { layer } => {
            store.create_db(&layer)?;
            println!("created database for layer '{layer}'");
        },
        Command::CreateGroup { layer, group } => {
            store.create_group(&layer, &group, None)?;
        },
        Command::RemoveGroup { layer, group } => {
            store.remove_group(&layer, &group)?;
        },
        Command::Get { group, name, layer, ty } => {
            let expected = match ty.data_type() {
                DataType::Unset => None,
                other => Some(other),
            };
            let (record, from) =
                store.get(layer.as_deref(), &group, Some(&name), expected)?;
            println!("[{from}] {group}:{name} = {}", record.value);
        },
        Command::Set { layer, group, name, value, ty } => {
            store.set_value(&layer, &group, &name, ty.parse_value(&value)?)?;
        },
        Command::Unset { layer, group, name, ty } => {
            let expected = match ty.data_type() {
                DataType::Unset => None,
                other => Some(other),
            };
            store.unset_value(&layer, &group, &name, expected)?;
        },
        Command::GetLabel { layer, group, name } => {
            let record = store.get_in_layer(&layer, &group, name.as_deref(), None)?;
            println!("{}", record.read_priv);
        },
        Command::SetLabel { layer, group, label, name } => {
            store.set_label(&layer, &group, name.as_deref(), &label, effective_uid())?;
        },
        Command::ListNames { layer, group, prefix } => {
            for name in store.list_names(&layer, group.as_deref(), prefix.as_deref())? {
                println!("{name}");
            }
        },
    }
    Ok(())
}

async fn run_socket(cfg: &Config, command: Command) -> Result<()> {
    let conn = ClientConnection::connect(&cfg.daemon.socket)
        .await
        .with_context(|| format!("connecting to {:?}", cfg.daemon.socket))?;

    match command {
        Command::Check => {
            println!("ok: daemon reachable at {:?}", cfg.daemon.socket);
        },
        Command::CreateDb { .. } => {
            bail!("create-db needs --direct; the daemon manages its own databases");
        },
        Command::CreateGroup { layer, group } => {
            conn.create_group(&layer, &group).await?;
        },
        Command::RemoveGroup { layer, group } => {
            conn.remove_group(&layer, &group).await?;
        },
        Command::Get { group, name, layer, ty } => {
            let value = conn
                .get_value(layer.as_deref(), &group, &name, ty.data_type())
                .await?;
            println!("{group}:{name} = {value}");
        },
        Command::Set { layer, group, name, value, ty } => {
            conn.set_value(&layer, &group, &name, ty.parse_value(&value)?)
                .await?;
        },
        Command::Unset { layer, group, name, ty } => {
            conn.unset_value(&layer, &group, &name, ty.data_type()).await?;
        },
        Command::GetLabel { layer, group, name } => {
            println!("{}", conn.get_label(&layer, &group, name.as_deref()).await?);
        },
        Command::SetLabel { layer, group, label, name } => {
            conn.set_label(&layer, &group, name.as_deref(), &label).await?;
        },
        Command::ListNames { layer, group, prefix } => {
            for name in conn
                .list_names(&layer, group.as_deref(), prefix.as_deref())
                .await?
            {
                println!("{name}");
            }
        },
    }
    conn.close();
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = Config::load_from_file(&args.config)
        .with_context(|| format!("loading config {:?}", args.config))?;

    if args.direct {
        run_direct(&cfg, args.command)
    } else {
        run_socket(&cfg, args.command).await
    }
}
