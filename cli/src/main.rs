use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{debug, info};
use rawscope_core::{
    AccessPlan, BlockDevice, FilesystemInfo, ListOptions, Partition, RawscopeError, DEFAULT_LIST_LIMIT,
    DEFAULT_PREVIEW_LIMIT,
};
use rawscope_platform::{is_elevated, PlatformDeviceManager, PlatformMountTable, RawBridge};
use serde::Serialize;
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

type Bridge = RawBridge<PlatformDeviceManager, PlatformMountTable>;

#[derive(Parser)]
#[command(name = "rawscope")]
#[command(about = "Inspect disks and filesystems by reading raw sectors, without mounting", long_about = None)]
struct Cli {
    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Raise log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List block devices
    List,
    /// Read the partition table of a device or disk image
    Partitions {
        /// Device path, e.g. /dev/sdb or \\.\PhysicalDrive1
        device: String,
    },
    /// Detect the filesystem on a partition and show its metadata
    Probe {
        /// Partition node, image file, or `path@offset+length` window
        partition: String,
    },
    /// Show whether and how a partition can be browsed right now
    Plan { partition: String },
    /// List a directory inside a partition
    Ls {
        partition: String,
        /// Directory relative to the partition root
        #[arg(default_value = "")]
        path: String,
        /// Entries to skip
        #[arg(long, default_value_t = 0)]
        offset: usize,
        /// Maximum entries to return
        #[arg(long, default_value_t = DEFAULT_LIST_LIMIT)]
        limit: usize,
    },
    /// Print the beginning of a file
    Cat {
        partition: String,
        path: String,
        /// Maximum bytes to read
        #[arg(long, default_value_t = DEFAULT_PREVIEW_LIMIT)]
        limit: usize,
        /// Show a hex dump instead of raw bytes
        #[arg(long)]
        hex: bool,
    },
    /// Probe every partition of every device (or of the given devices)
    Scan {
        /// Devices or images to scan instead of the enumerated ones
        devices: Vec<String>,
        /// Give up on a partition after this many seconds
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e, cli.json);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn report_error(e: &anyhow::Error, json: bool) {
    let raw = e.downcast_ref::<RawscopeError>();
    if json {
        let rendered = match raw {
            Some(err) => serde_json::to_string_pretty(&err.report()),
            None => serde_json::to_string_pretty(&serde_json::json!({ "message": format!("{:#}", e) })),
        };
        match rendered {
            Ok(text) => println!("{}", text),
            Err(_) => eprintln!("Error: {:#}", e),
        }
        return;
    }

    eprintln!("Error: {:#}", e);
    if let Some(RawscopeError::PermissionDenied { .. }) = raw {
        eprintln!("Raw device access needs elevated privileges (run as root or Administrator).");
    }
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    let bridge = Bridge::native();

    match &cli.command {
        Commands::List => {
            let devices = bridge.list_devices()?;
            if cli.json {
                return print_json(&devices);
            }
            print_devices(&devices);
        }
        Commands::Partitions { device } => {
            let partitions = bridge.list_partitions(device)?;
            if cli.json {
                return print_json(&partitions);
            }
            print_partitions(device, &partitions);
        }
        Commands::Probe { partition } => {
            let info = bridge.detect_and_parse(partition)?;
            if cli.json {
                return print_json(&info);
            }
            print_info(partition, &info);
        }
        Commands::Plan { partition } => {
            let plan = bridge.get_access_plan(partition);
            if cli.json {
                return print_json(&plan);
            }
            print_plan(&plan);
        }
        Commands::Ls {
            partition,
            path,
            offset,
            limit,
        } => {
            let options = ListOptions {
                offset: *offset,
                limit: *limit,
            };
            let listing = bridge.list_entries(partition, path, &options)?;
            if cli.json {
                return print_json(&listing);
            }
            for entry in &listing.entries {
                if entry.is_dir {
                    println!("{:>12}  {}/", "<DIR>", entry.name);
                } else {
                    println!("{:>12}  {}", entry.size, entry.name);
                }
            }
            if let Some(next) = listing.next_offset {
                println!("... more entries, continue with --offset {}", next);
            }
        }
        Commands::Cat {
            partition,
            path,
            limit,
            hex: as_hex,
        } => {
            let data = bridge.read_preview(partition, path, *limit)?;
            if cli.json {
                return print_json(&serde_json::json!({
                    "path": path,
                    "length": data.len(),
                    "hex": hex::encode(&data),
                }));
            }
            if *as_hex {
                print!("{}", hexdump(&data));
            } else {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(&data).context("writing to stdout")?;
                stdout.flush().context("writing to stdout")?;
            }
        }
        Commands::Scan { devices, timeout_secs } => {
            let rows = scan(bridge, devices, Duration::from_secs(*timeout_secs)).await?;
            if cli.json {
                return print_json(&rows);
            }
            print_scan(&rows);
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// One probed partition in `scan` output.
#[derive(Debug, Serialize)]
struct ScanRow {
    device: String,
    partition: String,
    info: Option<FilesystemInfo>,
    plan: Option<AccessPlan>,
    error: Option<String>,
}

impl ScanRow {
    fn failed(device: &str, partition: &str, error: String) -> Self {
        Self {
            device: device.to_string(),
            partition: partition.to_string(),
            info: None,
            plan: None,
            error: Some(error),
        }
    }
}

async fn scan(bridge: Bridge, requested: &[String], timeout: Duration) -> anyhow::Result<Vec<ScanRow>> {
    let bridge = Arc::new(bridge);

    let device_paths: Vec<String> = if requested.is_empty() {
        bridge.list_devices()?.into_iter().map(|d| d.path).collect()
    } else {
        requested.to_vec()
    };
    if !is_elevated() {
        info!("Not running elevated; raw reads of system disks may be refused");
    }

    let mut targets = Vec::new();
    for device in &device_paths {
        match bridge.list_partitions(device) {
            // A device with no table may still hold a filesystem directly.
            Ok(partitions) if partitions.is_empty() => targets.push((device.clone(), device.clone())),
            Ok(partitions) => targets.extend(partitions.into_iter().map(|p| (device.clone(), p.path))),
            Err(e) => {
                debug!("Skipping {}: {}", device, e);
                targets.push((device.clone(), device.clone()));
            }
        }
    }

    let handles: Vec<_> = targets
        .into_iter()
        .map(|(device, partition)| {
            let bridge = Arc::clone(&bridge);
            let path = partition.clone();
            let handle = tokio::task::spawn_blocking(move || {
                let info = bridge.detect_and_parse(&path);
                let plan = bridge.get_access_plan(&path);
                (info, plan)
            });
            (device, partition, handle)
        })
        .collect();

    let mut rows = Vec::new();
    for (device, partition, handle) in handles {
        let row = match tokio::time::timeout(timeout, handle).await {
            Ok(Ok((Ok(info), plan))) => ScanRow {
                device,
                partition,
                info: Some(info),
                plan: Some(plan),
                error: None,
            },
            Ok(Ok((Err(e), plan))) => ScanRow {
                plan: Some(plan),
                ..ScanRow::failed(&device, &partition, e.to_string())
            },
            Ok(Err(e)) => ScanRow::failed(&device, &partition, format!("probe task failed: {}", e)),
            Err(_) => ScanRow::failed(
                &device,
                &partition,
                format!("timed out after {}s", timeout.as_secs()),
            ),
        };
        rows.push(row);
    }
    Ok(rows)
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn print_devices(devices: &[BlockDevice]) {
    if devices.is_empty() {
        println!("No devices found.");
        return;
    }
    for device in devices {
        println!("{}", device.name);
        println!("  Path: {}", device.path);
        println!("  Size: {}", human_size(device.size_bytes));
        println!("  Type: {:?}", device.device_type);
        println!("  Removable: {}", if device.removable { "Yes" } else { "No" });
        for partition in &device.partitions {
            println!(
                "  #{} {} ({})",
                partition.number,
                partition.path,
                human_size(partition.size_bytes)
            );
        }
        println!();
    }
}

fn print_partitions(device: &str, partitions: &[Partition]) {
    if partitions.is_empty() {
        println!("No partitions found on {}.", device);
        return;
    }
    for p in partitions {
        let hint = p.fs_type.map(|t| t.to_string()).unwrap_or_else(|| "-".into());
        println!(
            "#{:<3} {:>10}  {:<8} {:<24} {}",
            p.number,
            human_size(p.size_bytes),
            hint,
            p.type_label,
            p.name
        );
        println!("     {}", p.path);
    }
}

fn print_info(partition: &str, info: &FilesystemInfo) {
    println!("{}", partition);
    println!("  Filesystem: {}", info.fs_type);
    println!("  Label: {}", if info.volume_name.is_empty() { "-" } else { info.volume_name.as_str() });
    println!("  Serial: {}", if info.serial_number.is_empty() { "-" } else { info.serial_number.as_str() });
    println!("  Block size: {}", info.block_size);
    println!(
        "  Total: {} ({} blocks)",
        human_size(info.total_bytes()),
        info.total_blocks
    );
    println!("  Free: {} ({} blocks)", human_size(info.free_bytes()), info.free_blocks);
    if !info.features.is_empty() {
        let features: Vec<&str> = info.features.iter().map(String::as_str).collect();
        println!("  Features: {}", features.join(", "));
    }
}

fn print_plan(plan: &AccessPlan) {
    println!("{}", plan.path);
    println!(
        "  Filesystem: {}",
        plan.fs_type.map(|t| t.to_string()).unwrap_or_else(|| "unknown".into())
    );
    println!("  State: {:?}", plan.state);
    println!("  Browsable now: {}", if plan.can_browse_now { "Yes" } else { "No" });
    if let Some(mount_point) = &plan.mount_point {
        println!("  Mounted at: {}", mount_point.display());
    }
    if plan.needs_elevation {
        println!("  Needs elevated privileges");
    }
    println!("  {}", plan.message);
}

fn print_scan(rows: &[ScanRow]) {
    if rows.is_empty() {
        println!("Nothing to scan.");
        return;
    }
    for row in rows {
        let fs = row
            .info
            .as_ref()
            .map(|i| i.fs_type.to_string())
            .or_else(|| row.plan.as_ref().and_then(|p| p.fs_type).map(|t| t.to_string()))
            .unwrap_or_else(|| "-".into());
        let label = row.info.as_ref().map(|i| i.volume_name.as_str()).unwrap_or("");
        let state = row
            .plan
            .as_ref()
            .map(|p| format!("{:?}", p.state))
            .unwrap_or_else(|| "-".into());
        println!("{:<40} {:<7} {:<20} {:<16}", row.partition, fs, state, label);
        if let Some(error) = &row.error {
            println!("    {}", error);
        }
    }
}

/// Classic 16-bytes-per-line dump: offset, hex bytes, printable ASCII.
fn hexdump(data: &[u8]) -> String {
    let mut out = String::new();
    for (line, chunk) in data.chunks(16).enumerate() {
        let bytes: Vec<String> = chunk.iter().map(|b| hex::encode([*b])).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        out.push_str(&format!("{:08x}  {:<47}  |{}|\n", line * 16, bytes.join(" "), ascii));
    }
    out
}
