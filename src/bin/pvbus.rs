use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use pvbridge::bus::{BusEntry, BusValue};
use pvbridge::protocol::{encode_line, BusRequest, BusResponse, ResponseStatus, WatchEvent};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "7070";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> CliResult<()> {
    let matches = App::new("pvbus")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Energy Systems Engineering Team")
        .about("Inspect and drive the PV inverter bridge bus")
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Bridge host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Bus access port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable verbose output")
                .global(true),
        )
        .subcommand(SubCommand::with_name("ping").about("Check that the bridge answers"))
        .subcommand(
            SubCommand::with_name("get")
                .about("Read one bus path")
                .arg(Arg::with_name("path").help("Bus path, e.g. /Ac/Power").required(true)),
        )
        .subcommand(
            SubCommand::with_name("set")
                .about("Write a bus path as an external writer")
                .arg(Arg::with_name("path").help("Bus path").required(true))
                .arg(
                    Arg::with_name("value")
                        .help("Integer, float, text, or null")
                        .required(true),
                ),
        )
        .subcommand(SubCommand::with_name("dump").about("List every registered path"))
        .subcommand(
            SubCommand::with_name("monitor")
                .about("Stream published snapshots")
                .arg(
                    Arg::with_name("duration")
                        .short("d")
                        .long("duration")
                        .value_name("SECONDS")
                        .help("Monitor duration in seconds (default: infinite)")
                        .takes_value(true)
                        .validator(|v| match v.parse::<u64>() {
                            Ok(_) => Ok(()),
                            Err(_) => Err("Duration must be a whole number of seconds".into()),
                        }),
                ),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let format = matches.value_of("format").unwrap_or("table");
    let verbose = matches.is_present("verbose");

    if verbose {
        println!("{}", "pvbus - PV inverter bridge".bright_blue().bold());
        println!("{} {}:{}", "Connecting to".dimmed(), host, port);
    }

    match matches.subcommand() {
        ("ping", _) => handle_ping(host, port, format).await?,
        ("get", Some(sub_matches)) => handle_get(sub_matches, host, port, format).await?,
        ("set", Some(sub_matches)) => handle_set(sub_matches, host, port, format).await?,
        ("dump", _) => handle_dump(host, port, format).await?,
        ("monitor", Some(sub_matches)) => handle_monitor(sub_matches, host, port, format).await?,
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Test connection", "pvbus ping".bright_cyan());
            println!("  {} Show every path", "pvbus dump".bright_cyan());
            println!("  {} Watch published values", "pvbus monitor".bright_cyan());
        }
    }

    Ok(())
}

async fn handle_ping(host: &str, port: u16, format: &str) -> CliResult<()> {
    let response = send_request(host, port, &BusRequest::Ping).await?;
    match format {
        "json" => println!("{}", serde_json::to_string(&response)?),
        "compact" => println!("{}", "PONG".bright_green()),
        _ => {
            if response.is_success() {
                println!("{} {}", "OK".green(), "Bridge bus is responsive".bright_green());
            } else {
                print_failure("Ping", &response);
            }
        }
    }
    Ok(())
}

async fn handle_get(matches: &ArgMatches<'_>, host: &str, port: u16, format: &str) -> CliResult<()> {
    let path = matches.value_of("path").unwrap_or_default().to_string();
    let response = send_request(host, port, &BusRequest::Get { path: path.clone() }).await?;
    print_value_result(&path, &response, format)
}

async fn handle_set(matches: &ArgMatches<'_>, host: &str, port: u16, format: &str) -> CliResult<()> {
    let path = matches.value_of("path").unwrap_or_default().to_string();
    let value = parse_value(matches.value_of("value").unwrap_or_default());
    let request = BusRequest::Set {
        path: path.clone(),
        value,
    };
    let response = send_request(host, port, &request).await?;
    print_value_result(&path, &response, format)
}

async fn handle_dump(host: &str, port: u16, format: &str) -> CliResult<()> {
    let response = send_request(host, port, &BusRequest::Dump).await?;
    if !response.is_success() {
        print_failure("Dump", &response);
        return Ok(());
    }
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&response.items)?),
        "compact" => {
            for entry in &response.items {
                println!("{}={}", entry.path, entry.value);
            }
        }
        _ => print_entries_table(&response.items),
    }
    Ok(())
}

async fn handle_monitor(matches: &ArgMatches<'_>, host: &str, port: u16, format: &str) -> CliResult<()> {
    let duration = matches
        .value_of("duration")
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);

    println!("{}", "Monitoring published snapshots (Press Ctrl+C to stop)...".bright_blue().bold());

    let watch = watch_snapshots(host, port, format);
    match duration {
        Some(limit) => match tokio::time::timeout(limit, watch).await {
            Ok(result) => result?,
            Err(_) => println!("{}", "Monitor duration elapsed".dimmed()),
        },
        None => watch.await?,
    }
    Ok(())
}

async fn watch_snapshots(host: &str, port: u16, format: &str) -> CliResult<()> {
    let (mut reader, mut writer) = connect(host, port).await?;
    let ack = exchange(&mut reader, &mut writer, &BusRequest::Watch).await?;
    if !ack.is_success() {
        print_failure("Watch", &ack);
        return Ok(());
    }

    if format == "table" {
        println!("{}", "┌────────────┬────────┬──────────┬────────────┬─────────────────────────────┐".bright_white());
        println!("{}", "│ Time       │ Rev    │ Power    │ Energy     │ L1 / L2 / L3 Power          │".bright_white());
        println!("{}", "├────────────┼────────┼──────────┼────────────┼─────────────────────────────┤".bright_white());
    }

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            println!("{}", "Bridge closed the connection".yellow());
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if format == "json" {
            println!("{}", trimmed);
            continue;
        }
        let Ok(event) = serde_json::from_str::<WatchEvent>(trimmed) else {
            continue;
        };
        print_snapshot(&event, format);
    }
    Ok(())
}

fn print_snapshot(event: &WatchEvent, format: &str) {
    let state = &event.state;
    let seconds = event.timestamp_ms / 1000;
    match format {
        "compact" => println!(
            "[{}] rev={} power={:.1}W energy={:.2}KWh",
            seconds, state.revision, state.power, state.energy_kwh
        ),
        _ => {
            let power = if state.power > 0.0 {
                format!("{:>7.1}W", state.power).bright_green()
            } else {
                format!("{:>7.1}W", state.power).dimmed()
            };
            let phases = format!(
                "{:>7.1} / {:>7.1} / {:>7.1}",
                state.phase_power[0], state.phase_power[1], state.phase_power[2]
            );
            println!(
                "│ {:>10} │ {:>6} │ {} │ {:>7.2}KWh │ {:<27} │",
                seconds, state.revision, power, state.energy_kwh, phases
            );
        }
    }
}

fn print_entries_table(entries: &[BusEntry]) {
    println!("\n{}", "Bus paths".bright_blue().bold());
    println!("{}", "═════════".bright_blue());
    for entry in entries {
        let text = if entry.text.is_empty() {
            "--".dimmed()
        } else {
            entry.text.bright_cyan()
        };
        let marker = if entry.writable { "rw".bright_yellow() } else { "ro".dimmed() };
        println!("{} {:<24} {}", marker, entry.path.bright_white(), text);
    }
}

fn print_value_result(path: &str, response: &BusResponse, format: &str) -> CliResult<()> {
    match format {
        "json" => println!("{}", serde_json::to_string(response)?),
        "compact" => match &response.value {
            Some(value) if response.is_success() => println!("{}", value),
            _ => println!("{}", "ERR".bright_red()),
        },
        _ => {
            if response.is_success() {
                let value = response.value.clone().unwrap_or(BusValue::Empty);
                let text = response.text.clone().unwrap_or_default();
                println!("{} {} = {} {}", "OK".green(), path.bright_white(), value.to_string().bright_cyan(), text.dimmed());
            } else {
                print_failure(path, response);
            }
        }
    }
    Ok(())
}

fn print_failure(action: &str, response: &BusResponse) {
    let message = response.message.as_deref().unwrap_or("no details");
    match response.status {
        ResponseStatus::Rejected => {
            println!("{} {} rejected: {}", "X".red(), action.bright_white(), message.bright_red());
        }
        ResponseStatus::InvalidRequest => {
            println!("{} invalid request: {}", "X".red(), message.bright_red());
        }
        _ => {
            println!("{} {} failed: {}", "X".red(), action.bright_white(), message.bright_red());
        }
    }
}

/// Command-line values: `null`, integers, floats, anything else as text.
fn parse_value(raw: &str) -> BusValue {
    if raw == "null" {
        BusValue::Empty
    } else if let Ok(v) = raw.parse::<i64>() {
        BusValue::Int(v)
    } else if let Ok(v) = raw.parse::<f64>() {
        BusValue::Float(v)
    } else {
        BusValue::Text(raw.to_string())
    }
}

async fn connect(host: &str, port: u16) -> CliResult<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let addr = format!("{}:{}", host, port);
    match TcpStream::connect(&addr).await {
        Ok(stream) => {
            let (reader, writer) = stream.into_split();
            Ok((BufReader::new(reader), writer))
        }
        Err(e) => {
            eprintln!("{} Failed to connect to the bridge at {}", "X".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Is pvbridge running with [bus] enabled?", "?".yellow());
            } else {
                eprintln!("{} Network error: {}", "!".yellow(), e.to_string().bright_red());
            }
            Err(e.into())
        }
    }
}

async fn exchange(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    request: &BusRequest,
) -> CliResult<BusResponse> {
    writer.write_all(encode_line(request)?.as_bytes()).await?;
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err("bridge closed the connection".into());
    }
    Ok(serde_json::from_str(line.trim())?)
}

async fn send_request(host: &str, port: u16, request: &BusRequest) -> CliResult<BusResponse> {
    let (mut reader, mut writer) = connect(host, port).await?;
    match tokio::time::timeout(REQUEST_TIMEOUT, exchange(&mut reader, &mut writer, request)).await {
        Ok(result) => result,
        Err(_) => {
            eprintln!("{} Request timed out after {} seconds", "!".yellow(), REQUEST_TIMEOUT.as_secs());
            Err("request timeout".into())
        }
    }
}
