use std::path::Path;
use std::process::exit;

use anyhow::anyhow;
use clap::{crate_authors, crate_version, App as ClapApp, Arg, ArgMatches};
use env_logger::Env;
use tokio::runtime::Runtime;

use labinstr::address::Address;
use labinstr::compiler::{compile, ShotRequest};
use labinstr::config::ConnectionTable;
use labinstr::inventory::Inventory;
use labinstr::session::{Session, SessionOptions};
use labinstr::worker::WorkerHandle;
use labinstr::{builtin, Error};
use labinstr_protocol::ShotFile;

fn table_arg() -> Arg<'static> {
    Arg::new("table")
        .long("table")
        .short('t')
        .takes_value(true)
        .required(true)
        .help("Connection table (TOML)")
}

fn unescape(x: &str) -> String {
    x.replace("\\r", "\r").replace("\\n", "\n")
}

fn print_json<T: serde::Serialize>(x: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(x)?);
    Ok(())
}

fn load_table(matches: &ArgMatches) -> anyhow::Result<ConnectionTable> {
    let path = matches.value_of("table").ok_or_else(|| anyhow!("No connection table"))?;
    Ok(ConnectionTable::load(path)?)
}

fn run_compile(matches: &ArgMatches) -> anyhow::Result<()> {
    let table = load_table(matches)?;
    let request = matches.value_of("request").ok_or_else(|| anyhow!("No shot request"))?;
    let out = matches.value_of("out").ok_or_else(|| anyhow!("No output file"))?;
    let shot = compile(&table, &ShotRequest::load(request)?)?;
    shot.save(out)?;
    println!("Compiled {} devices into {}", shot.devices.len(), out);
    Ok(())
}

async fn run_shot(matches: &ArgMatches) -> anyhow::Result<()> {
    let table = load_table(matches)?;
    let path = matches.value_of("shot").ok_or_else(|| anyhow!("No shot file"))?;
    let fresh = matches.is_present("fresh");
    let shot = ShotFile::load(path)?;

    let inventory = Inventory::new();
    let mut workers: Vec<WorkerHandle> = Vec::new();
    for name in shot.devices.keys() {
        let device = table
            .device(name)
            .ok_or_else(|| anyhow!("`{}` is not in the connection table", name))?;
        workers.push(inventory.connect(device)?);
    }

    let mut armed = Vec::new();
    let mut failure = None;
    for worker in &workers {
        match worker.transition_to_buffered(Path::new(path), fresh).await {
            Ok(values) => {
                println!("{} buffered: {:?}", worker.name(), values);
                armed.push(worker);
            }
            Err(err) => {
                failure = Some(anyhow!("{}: {}", worker.name(), err));
                break;
            }
        }
    }
    if let Some(err) = failure {
        for worker in armed {
            if let Err(x) = worker.abort().await {
                log::error!("{}: abort failed: {}", worker.name(), x);
            }
        }
        inventory.disconnect_all();
        return Err(err);
    }
    for worker in armed {
        let values = worker.transition_to_manual().await?;
        println!("{} manual: {:?}", worker.name(), values);
        worker.shutdown().await?;
    }
    inventory.disconnect_all();
    Ok(())
}

async fn run_status(matches: &ArgMatches) -> anyhow::Result<()> {
    let table = load_table(matches)?;
    let name = matches.value_of("device").ok_or_else(|| anyhow!("No device"))?;
    let device = table
        .device(name)
        .ok_or_else(|| anyhow!("`{}` is not in the connection table", name))?;
    let inventory = Inventory::new();
    let worker = inventory.connect(device)?;
    let report = worker.check_status().await;
    worker.shutdown().await?;
    inventory.disconnect_all();
    print_json(&report?)
}

async fn run_query(matches: &ArgMatches) -> anyhow::Result<()> {
    let addr = matches.value_of("address").ok_or_else(|| anyhow!("No address"))?;
    let cmd = matches.value_of("command").ok_or_else(|| anyhow!("No command"))?;
    let addr = Address::parse(addr)?;
    let mut options = SessionOptions::default();
    if let Some(term) = matches.value_of("term") {
        options.write_termination = unescape(term);
    }
    let mut session = Session::open(&addr, options).await?;
    let ret = if cmd.contains('?') {
        session.query(cmd).await.map(Some)
    } else {
        session.write(cmd).await.map(|_| None)
    };
    session.close().await;
    if let Some(reply) = ret? {
        println!("{}", reply);
    }
    Ok(())
}

fn main() {
    let matches = ClapApp::new("Lab instrument plugins")
        .author(crate_authors!())
        .version(crate_version!())
        .about("Compile shots and drive lab instruments through them")
        .arg(Arg::new("verbose").long("verbose").short('v').help("Log verbose output"))
        .subcommand_required(true)
        .subcommand(
            ClapApp::new("compile")
                .about("Compile a shot request into a shot file")
                .arg(table_arg())
                .arg(
                    Arg::new("request")
                        .long("request")
                        .short('r')
                        .takes_value(true)
                        .required(true)
                        .help("Shot request (TOML)"),
                )
                .arg(
                    Arg::new("out")
                        .long("out")
                        .short('o')
                        .takes_value(true)
                        .required(true)
                        .help("Shot file to write"),
                ),
        )
        .subcommand(
            ClapApp::new("run")
                .about("Program all devices of a shot, then read them out")
                .arg(table_arg())
                .arg(
                    Arg::new("shot")
                        .long("shot")
                        .short('s')
                        .takes_value(true)
                        .required(true)
                        .help("Compiled shot file"),
                )
                .arg(Arg::new("fresh").long("fresh").help("Ignore cached instrument state")),
        )
        .subcommand(
            ClapApp::new("status")
                .about("Read and decode the status register of a device")
                .arg(table_arg())
                .arg(
                    Arg::new("device")
                        .long("device")
                        .short('d')
                        .takes_value(true)
                        .required(true),
                ),
        )
        .subcommand(
            ClapApp::new("query")
                .about("Send a single command, print the reply of queries")
                .arg(
                    Arg::new("address")
                        .long("address")
                        .short('a')
                        .takes_value(true)
                        .required(true),
                )
                .arg(
                    Arg::new("term")
                        .long("term")
                        .takes_value(true)
                        .help("Write termination, e.g. \\r\\n"),
                )
                .arg(Arg::new("command").required(true)),
        )
        .subcommand(ClapApp::new("profiles").about("List built-in instrument profiles"))
        .get_matches();

    if matches.is_present("verbose") {
        env_logger::Builder::from_env(Env::default().default_filter_or("labinstr=debug")).init();
    } else {
        env_logger::init();
    }

    let rt = match Runtime::new() {
        Ok(x) => x,
        Err(err) => {
            eprintln!("Cannot start runtime: {}", err);
            exit(1);
        }
    };
    let ret = rt.block_on(async move {
        match matches.subcommand() {
            Some(("compile", x)) => run_compile(x),
            Some(("run", x)) => run_shot(x).await,
            Some(("status", x)) => run_status(x).await,
            Some(("query", x)) => run_query(x).await,
            Some(("profiles", _)) => {
                for key in builtin::keys() {
                    let profile = builtin::profile(key)?;
                    println!("{:<20} {}", key, profile.description);
                }
                Ok(())
            }
            _ => Err(anyhow!("Unknown command")),
        }
    });
    if let Err(err) = ret {
        match err.downcast_ref::<Error>() {
            Some(Error::Range(_)) | Some(Error::Argument(_)) => eprintln!("Invalid input: {}", err),
            _ => eprintln!("{}", err),
        }
        exit(1);
    }
}
