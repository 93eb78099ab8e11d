use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;

use dashsync::{
    boot::serial_boot_control,
    bootloader::Stm32Bootloader,
    image,
    protocol::Link,
    transport::{LinkMode, SharedTransport, SystemPorts},
    BlockFlasher, BootControl, ChunkedFlasher, Config, ProgressHandle, SerialTransport,
};

const DEFAULT_CONFIG: &str = "dashsync.yaml";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(
    name = "dashsync",
    about = "Flash and sync the dashboard display companion over its serial link"
)]
struct Cli {
    /// Configuration file (defaults to ./dashsync.yaml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Serial port, overriding the configuration
    #[arg(long, global = true)]
    port: Option<String>,
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,
    /// Reset the companion into its application
    Reset,
    /// Hold the companion in its system bootloader
    Bootloader,
    /// Write firmware page by page through the system bootloader
    Flash {
        /// Firmware file: binary, Intel HEX, plain hex or ELF
        path: PathBuf,
        /// Read back every page after writing
        #[arg(long, overrides_with = "no_verify")]
        verify: bool,
        #[arg(long)]
        no_verify: bool,
    },
    /// Send firmware in chunks through the running application
    Update {
        path: PathBuf,
    },
    /// Upload background images whose checksum differs from the companion's
    Sync,
    /// Print the CRC-32 of a PNG's transcoded pixels
    Checksum {
        path: PathBuf,
    },
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None if Path::new(DEFAULT_CONFIG).is_file() => Config::load(DEFAULT_CONFIG)?,
        None => Config::default(),
    };
    if let Some(port) = &cli.port {
        config.serial.port = Some(port.clone());
    }
    Ok(config)
}

fn open_transport(config: &Config) -> SharedTransport {
    SerialTransport::new(
        SystemPorts::new(config.serial.port.clone()),
        config.serial.clone(),
    )
    .shared()
}

/// Renders the progress snapshot until the worker finishes.
fn watch<T>(progress: &ProgressHandle, worker: JoinHandle<Result<T>>) -> Result<T> {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")?
            .progress_chars("=> "),
    );
    while !worker.is_finished() {
        let snapshot = progress.snapshot();
        bar.set_position(snapshot.percentage as u64);
        bar.set_message(snapshot.message);
        thread::sleep(POLL_INTERVAL);
    }

    let result = worker
        .join()
        .map_err(|_| anyhow::format_err!("flash worker panicked"))?;
    let snapshot = progress.snapshot();
    bar.set_position(snapshot.percentage as u64);
    if snapshot.error {
        bar.abandon_with_message(snapshot.error_message);
    } else {
        bar.finish_with_message(snapshot.message);
    }
    result
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let config = load_config(&cli)?;
    match &cli.command {
        Commands::Ports => {
            let ports = SystemPorts::scan_ports()?;
            if ports.is_empty() {
                log::warn!("No serial ports found");
            }
            for port in ports {
                println!("{}", port);
            }
        }
        Commands::Reset | Commands::Bootloader => {
            let transport = open_transport(&config);
            transport.lock().start(LinkMode::Bootloader, None)?;
            let mut boot = serial_boot_control(&transport, &config.boot);
            if matches!(cli.command, Commands::Reset) {
                boot.enter_application_mode();
            } else {
                boot.enter_bootloader_mode();
            }
            transport.lock().stop();
        }
        Commands::Flash {
            path,
            verify,
            no_verify,
        } => {
            let verify = match (verify, no_verify) {
                (true, _) => true,
                (_, true) => false,
                _ => config.flash.verify,
            };
            let transport = open_transport(&config);
            let programmer = Stm32Bootloader::new(
                transport.clone(),
                config.timeouts.command(),
                config.timeouts.transfer(),
            );
            let progress = ProgressHandle::new();
            let mut flasher = BlockFlasher::new(
                programmer,
                serial_boot_control(&transport, &config.boot),
                progress.clone(),
                config.flash.base_address,
            )
            .with_verify(verify);
            log::info!(
                "Flashing {} (verify {})",
                path.display(),
                if flasher.verify_enabled() { "on" } else { "off" }
            );

            let path = path.clone();
            let worker = thread::Builder::new()
                .name("block-flash".into())
                .spawn(move || flasher.flash_file(path))?;
            let report = watch(&progress, worker)?;
            log::info!(
                "Wrote {} pages, flash end {:#010x}",
                report.pages,
                report.end_address
            );
        }
        Commands::Update { path } => {
            let transport = open_transport(&config);
            let link = Link::attach(&transport)?;
            let progress = ProgressHandle::new();
            let flasher = Arc::new(Mutex::new(ChunkedFlasher::new(
                link,
                serial_boot_control(&transport, &config.boot),
                progress.clone(),
                config.timeouts.clone(),
            )));
            let worker =
                ChunkedFlasher::flash_file_async(flasher, path, config.flash.base_address)?;
            let report = watch(&progress, worker)?;
            log::info!("Sent {} chunks, {} bytes", report.chunks, report.bytes);
        }
        Commands::Sync => {
            if config.assets.images.is_empty() {
                log::warn!("No images configured under assets.images");
                return Ok(());
            }
            let transport = open_transport(&config);
            let link = Link::attach(&transport)?;
            let progress = ProgressHandle::new();
            let mut flasher = ChunkedFlasher::new(
                link,
                serial_boot_control(&transport, &config.boot),
                progress.clone(),
                config.timeouts.clone(),
            );
            let mut buffer = vec![0u8; config.assets.buffer_capacity];
            let report = dashsync::synchronize_assets(
                &mut flasher,
                &progress,
                &config.assets.images,
                &config.assets.directory,
                &mut buffer,
            )?;
            print!("{}", serde_yaml::to_string(&report)?);
        }
        Commands::Checksum { path } => {
            let file = File::open(path)?;
            let crc = image::checksum_transcoded(BufReader::new(file))?;
            println!("{:08x}  {}", crc, path.display());
        }
    }

    Ok(())
}
