use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use flashr_core::flash::{self, FlashEvent, FlashOptions, FlashResult};
use flashr_core::image::registry;
use flashr_core::{Access, Device, Format, Image, OpenImage, OpenOptions, platform};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flashr")]
#[command(about = "A safe, interactive disk imaging tool", version)]
struct Cli {
    /// Log lifecycle details to stderr (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an image to a device interactively
    Write {
        /// Image to write: raw, compressed raw, zip or dmg
        #[arg(required = true)]
        image: PathBuf,

        /// Target device; prompts when omitted
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,

        /// Skip write verification
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,

        /// Write every byte even when the image carries a block-map
        #[arg(long)]
        dense: bool,

        /// Bypass the page cache when writing the device
        #[arg(long)]
        direct: bool,
    },
    /// Read a device to an image file interactively
    Read {
        /// Output image file
        #[arg(required = true)]
        image: PathBuf,

        /// Source device; prompts when omitted
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,

        /// Skip verification of the written file
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,
    },
    /// Show what flashr knows about an image
    Info {
        #[arg(required = true)]
        image: PathBuf,
    },
    /// List available removable devices
    List,
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "flashr=debug,flashr_core=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Picks the device named on the command line, or presents an interactive
/// menu for the user to select one.
fn select_device(devices: &[Device], requested: Option<&Path>, prompt: &str) -> Result<Device> {
    if devices.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    if let Some(path) = requested {
        return devices
            .iter()
            .find(|d| d.matches(path))
            .cloned()
            .ok_or_else(|| anyhow!("{} is not a removable device", path.display()));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str, assume_yes: bool) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

struct Styles {
    write: ProgressStyle,
    verify: ProgressStyle,
    unknown: ProgressStyle,
}

impl Styles {
    fn new() -> Result<Self> {
        let bar = |color: &str| {
            ProgressStyle::default_bar()
                .template(&format!(
                    "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}})"
                ))
                .map(|style| style.progress_chars("■ "))
        };
        Ok(Self {
            write: bar("green")?,
            verify: bar("magenta")?,
            unknown: ProgressStyle::default_spinner()
                .template("{prefix:12} [{elapsed_precise}] {spinner:.blue} {bytes} ({bytes_per_sec})")?,
        })
    }
}

/// Runs the flash pipeline with progress bars hooked to its events.
fn flash_with_progress(
    source: &mut OpenImage,
    destination: &mut OpenImage,
    options: &FlashOptions,
    running: &AtomicBool,
) -> Result<FlashResult> {
    let styles = Styles::new()?;
    let write_pb = ProgressBar::new(0);
    let verify_pb = ProgressBar::hidden();

    let on_event = |event: FlashEvent| match event {
        FlashEvent::Start { total, sparse } => {
            write_pb.set_prefix(if sparse { "Writing*" } else { "Writing" });
            match total {
                Some(total) => {
                    write_pb.set_length(total);
                    write_pb.set_style(styles.write.clone());
                }
                None => write_pb.set_style(styles.unknown.clone()),
            }
        }
        FlashEvent::Progress(stats) => write_pb.set_position(stats.bytes_read),
        FlashEvent::VerifyStart { total } => {
            write_pb.finish_with_message("Write complete.");
            verify_pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
            verify_pb.set_prefix("Verifying");
            match total {
                Some(total) => {
                    verify_pb.set_length(total);
                    verify_pb.set_style(styles.verify.clone());
                }
                None => verify_pb.set_style(styles.unknown.clone()),
            }
        }
        FlashEvent::VerifyProgress { bytes } => verify_pb.set_position(bytes),
    };

    match flash::run(source, destination, options, running, on_event) {
        Ok(result) => {
            if result.verification.is_some() {
                verify_pb.finish_with_message("Verification successful.");
            } else {
                write_pb.finish_with_message("Write complete (verification skipped).");
            }
            Ok(result)
        }
        Err(e) => {
            // Unblock the terminal before the error is printed.
            write_pb.abandon_with_message("❌ Operation failed.");
            verify_pb.finish_and_clear();
            Err(e.into())
        }
    }
}

fn describe(image: &OpenImage) {
    let metadata = image.metadata();
    let bytes = |value: Option<u64>| value.map_or_else(|| "unknown".to_string(), |v| HumanBytes(v).to_string());

    println!("  Image:       {}", style(image.path().display()).cyan());
    println!("  Format:      {}", image.format());
    println!("  Size:        {}", bytes(metadata.size));
    if metadata.is_compressed() {
        println!("  Compressed:  {}", bytes(metadata.compressed_size));
    }
    if let Some(name) = &metadata.name {
        println!("  Name:        {name}");
    }
    if let Some(title) = metadata
        .manifest
        .as_ref()
        .and_then(|manifest| manifest.get("name"))
        .and_then(|name| name.as_str())
    {
        println!("  Manifest:    {title}");
    }
    if let Some(map) = &metadata.block_map {
        println!(
            "  Block map:   {} of {} mapped ({} byte blocks)",
            HumanBytes(map.mapped_size()),
            HumanBytes(map.image_size()),
            map.block_size()
        );
    }
    println!("  Supports:    {:?}", image.capability());
}

fn write(
    image: PathBuf,
    device: Option<PathBuf>,
    yes: bool,
    options: FlashOptions,
    direct: bool,
    running: &AtomicBool,
) -> Result<()> {
    let mut source = Image::from_path(&image)
        .and_then(|img| img.open(&OpenOptions::new()))
        .with_context(|| format!("cannot open {}", image.display()))?;

    let devices = platform::list_devices()?;
    let device = select_device(&devices, device.as_deref(), "Select the target device to WRITE to")?;

    println!(
        "{} This will erase all data on '{}' ({:.1} GB).",
        style("WARNING:").red().bold(),
        device.description,
        device.size_gb(),
    );
    println!("  Device:      {}", style(device.device_path.display()).cyan());
    describe(&source);
    println!();

    if !confirm_operation("Are you sure you want to proceed?", yes)? {
        println!("Write operation cancelled.");
        return Ok(());
    }

    println!();

    let open_options = OpenOptions::new().access(Access::ReadWrite).direct_io(direct);
    let mut destination = Image::new(&device.device_path, Format::BlockDevice).open(&open_options)?;
    let result = flash_with_progress(&mut source, &mut destination, &options, running)?;
    destination.close()?;
    source.close()?;

    debug!(?result, "write finished");
    println!(
        "\n✨ Successfully flashed {} with {} ({} written{}).",
        style(device.device_path.display()).cyan(),
        style(image.display()).cyan(),
        HumanBytes(result.stats.bytes_written),
        if result.sparse { ", sparse" } else { "" }
    );
    Ok(())
}

fn read(
    image: PathBuf,
    device: Option<PathBuf>,
    yes: bool,
    options: FlashOptions,
    running: &AtomicBool,
) -> Result<()> {
    if registry::is_compressed(&image) {
        bail!("cannot write a compressed image: {}", image.display());
    }

    let devices = platform::list_devices()?;
    let device = select_device(&devices, device.as_deref(), "Select the source device to READ from")?;

    println!(
        "This will read {:.1} GB from '{}'.",
        device.size_gb(),
        device.description
    );
    println!("  Device: {}", style(device.device_path.display()).cyan());
    println!("  Output: {}", style(image.display()).cyan());
    println!();

    if !confirm_operation("Are you sure you want to proceed?", yes)? {
        println!("Read operation cancelled.");
        return Ok(());
    }

    println!();

    let mut source = Image::new(&device.device_path, Format::BlockDevice).open(&OpenOptions::new())?;
    let size = source.metadata().size;
    let mut destination = Image::new(&image, Format::RawImage).create(&OpenOptions::new(), size)?;

    let result = flash_with_progress(&mut source, &mut destination, &options, running);
    if result.is_err() {
        drop(destination);
        std::fs::remove_file(&image).ok();
    } else {
        destination.close()?;
    }
    source.close()?;
    let result = result?;

    println!(
        "\n✨ Successfully read {} to {} ({}).",
        style(device.device_path.display()).cyan(),
        style(image.display()).cyan(),
        HumanBytes(result.stats.bytes_written)
    );
    Ok(())
}

fn info(image: PathBuf) -> Result<()> {
    let source = Image::from_path(&image)
        .and_then(|img| img.open(&OpenOptions::new()))
        .with_context(|| format!("cannot open {}", image.display()))?;
    describe(&source);
    source.close()?;
    Ok(())
}

fn list() -> Result<()> {
    let devices = platform::list_devices()?;
    if devices.is_empty() {
        println!("No removable devices found.");
        return Ok(());
    }

    println!("Found {} removable devices:", devices.len());
    println!("\n  {:<12} {:<25} {:<10} LOCATION", "DEVICE", "NAME", "SIZE");
    println!("  {:-<12} {:-<25} {:-<10} {:-<20}", "", "", "", "");
    for device in devices {
        let location = match device.mount_points.as_slice() {
            [] => "(Not mounted)".to_string(),
            points => points
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        };
        println!(
            "  {:<12} {:<25} {:>8.1} GB  {}",
            device.device_path.display(),
            device.description,
            device.size_gb(),
            location
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // This flag allows for graceful cancellation of operations.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    // Set up the Ctrl+C handler to clear the `running` flag.
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    match cli.command {
        Commands::Write {
            image,
            device,
            yes,
            no_verify,
            dense,
            direct,
        } => {
            let options = FlashOptions::new().verify(!no_verify).sparse(!dense);
            write(image, device, yes, options, direct, &running)
        }
        Commands::Read {
            image,
            device,
            yes,
            no_verify,
        } => {
            let options = FlashOptions::new().verify(!no_verify).sparse(false);
            read(image, device, yes, options, &running)
        }
        Commands::Info { image } => info(image),
        Commands::List => list(),
    }
}
