use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use fiasco_core::config::FlashConfig;
use fiasco_core::fiasco::{DEFAULT_NAME, FIASCO_SIGNATURE, Fiasco};
use fiasco_core::image::{Image, ImageMeta};
use fiasco_core::local::FileHostInfo;
use fiasco_core::operations::{DeviceHandle, OperationError, Outcome};
use fiasco_core::types::{ConfigField, ImageType};
use fiasco_core::{TracingObserver, detect};

#[derive(Parser, Debug)]
#[command(author, version, about = "Fiasco firmware flasher for Nokia Internet Tablets", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Perform all checks and logging but write nothing
    #[arg(long, global = true)]
    simulate: bool,

    /// Downgrade hash/type/device verification failures to warnings
    #[arg(long, global = true)]
    no_verify: bool,

    /// Load a flash profile (TOML) before applying command-line flags
    #[arg(long, global = true)]
    profile: Option<PathBuf>,

    /// Block device node for raw-disk mode
    #[arg(long, global = true)]
    raw_disk: Option<String>,

    /// Seconds to wait for a device (0 = forever)
    #[arg(long, global = true, default_value_t = 0)]
    wait: u64,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Flash image files or a whole fiasco container
    Flash {
        /// Image files; metadata is derived from the file names
        files: Vec<PathBuf>,

        /// Flash every image from this container instead
        #[arg(long)]
        fiasco: Option<PathBuf>,

        /// Reboot the device after flashing
        #[arg(long)]
        reboot: bool,
    },
    /// Dump an image from the device to a file
    Dump {
        /// Piece type to dump (e.g. mmc, rootfs)
        #[arg(long = "type")]
        image_type: String,

        /// Output file
        output: PathBuf,
    },
    /// Identify the connected device
    Identify,
    /// Reboot the device
    Reboot {
        /// Stay in update mode after the reboot
        #[arg(long)]
        update: bool,
    },
    /// Boot the kernel, optionally with a command line
    Boot { cmdline: Option<String> },
    /// Read a configuration field
    Get { field: String },
    /// Write a configuration field
    Set { field: String, value: String },
    /// Pack image files into a fiasco container
    Pack {
        /// Output container
        #[arg(short, long)]
        output: PathBuf,

        /// Container name
        #[arg(long)]
        name: Option<String>,

        /// Software release version
        #[arg(long)]
        sw_version: Option<String>,

        /// Image files
        files: Vec<PathBuf>,
    },
    /// Unpack a container into a directory
    Unpack {
        container: PathBuf,

        /// Target directory (default: current)
        #[arg(short = 'C', long)]
        dir: Option<PathBuf>,
    },
    /// Show information about an image or container file
    Info { file: PathBuf },
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn build_config(args: &Args) -> Result<FlashConfig> {
    let mut config = match &args.profile {
        Some(path) => FlashConfig::load_from_file(path)
            .with_context(|| format!("loading profile {}", path.display()))?,
        None => FlashConfig::default(),
    };
    config.simulate |= args.simulate;
    config.no_verify |= args.no_verify;
    if args.raw_disk.is_some() {
        config.raw_disk = args.raw_disk.clone();
    }
    if args.wait > 0 {
        config.wait_timeout_secs = args.wait;
    }
    Ok(config)
}

/// Detect a connection and run one operation, honoring the dispatch layer's
/// retry-after-switch contract: on a retry signal the device re-enumerates,
/// so detection runs again and the same operation is re-issued.
fn with_retry<T>(
    config: &FlashConfig,
    mut operation: impl FnMut(&mut DeviceHandle) -> Result<Outcome<T>, OperationError>,
) -> Result<T> {
    const MAX_SWITCHES: u32 = 3;
    let stop = AtomicBool::new(false);
    let host = FileHostInfo::default();

    for _ in 0..=MAX_SWITCHES {
        let connection = detect(config, &host, &TracingObserver, &stop)?;
        let mut handle = DeviceHandle::new(connection, config.clone());
        match operation(&mut handle)? {
            Outcome::Completed(value) => return Ok(value),
            Outcome::RetryAfterSwitch => {
                info!("Mode switch requested, waiting for the device to re-enumerate");
                std::thread::sleep(std::time::Duration::from_secs(2));
            }
        }
    }
    bail!("device still lacks support after {MAX_SWITCHES} mode switches")
}

fn load_images(files: &[PathBuf], config: &FlashConfig) -> Result<Vec<Image>> {
    files
        .iter()
        .map(|path| {
            Image::from_file(path, ImageMeta::default(), config)
                .with_context(|| format!("loading image {}", path.display()))
        })
        .collect()
}

fn run(args: Args) -> Result<()> {
    let config = build_config(&args)?;

    match args.command {
        Command::Flash {
            files,
            fiasco,
            reboot,
        } => {
            let mut images = match fiasco {
                Some(path) => {
                    let container = Fiasco::parse(&path, &config)
                        .with_context(|| format!("parsing container {}", path.display()))?;
                    info!(name = %container.name, count = container.images.len(), "Container loaded");
                    container.images
                }
                None => load_images(&files, &config)?,
            };
            if images.is_empty() {
                bail!("nothing to flash");
            }

            for image in &mut images {
                info!(piece = %image.image_type, size = image.size(), "Flashing");
                with_retry(&config, |handle| handle.flash_image(image))?;
            }
            if reboot {
                with_retry(&config, |handle| handle.reboot(false))?;
            }
            println!("Flashed {} image(s)", images.len());
        }

        Command::Dump { image_type, output } => {
            let image_type: ImageType = image_type
                .parse()
                .map_err(|_| anyhow!("unknown image type: {image_type}"))?;
            let copied = with_retry(&config, |handle| {
                let file = File::create(&output)?;
                let mut out = BufWriter::new(file);
                handle.dump_image(image_type, &mut out)
            })?;
            println!("Dumped {copied} bytes to {}", output.display());
        }

        Command::Identify => {
            let ident = with_retry(&config, |handle| handle.identify())?;
            println!("Device: {} ({})", ident.model, ident.model.product_name());
            if let Some(hwrev) = ident.hwrev {
                println!("Hardware revision: {hwrev}");
            }
            if let Some(version) = &ident.version {
                println!("Version: {version}");
            }
        }

        Command::Reboot { update } => {
            with_retry(&config, |handle| handle.reboot(update))?;
            println!("Reboot requested");
        }

        Command::Boot { cmdline } => {
            with_retry(&config, |handle| handle.boot(cmdline.as_deref()))?;
            println!("Boot requested");
        }

        Command::Get { field } => {
            let field: ConfigField = field
                .parse()
                .map_err(|_| anyhow!("unknown field: {field}"))?;
            let value = with_retry(&config, |handle| handle.get_field(field))?;
            println!("{value}");
        }

        Command::Set { field, value } => {
            let field: ConfigField = field
                .parse()
                .map_err(|_| anyhow!("unknown field: {field}"))?;
            with_retry(&config, |handle| handle.set_field(field, &value))?;
            println!("{field} set");
        }

        Command::Pack {
            output,
            name,
            sw_version,
            files,
        } => {
            let images = load_images(&files, &config)?;
            let mut container = Fiasco::new(name.unwrap_or_else(|| DEFAULT_NAME.to_string()));
            container.sw_version = sw_version;
            container.images = images;
            container
                .write(&output)
                .with_context(|| format!("writing {}", output.display()))?;
            println!(
                "Packed {} image(s) into {}",
                container.images.len(),
                output.display()
            );
        }

        Command::Unpack { container, dir } => {
            let mut fiasco = Fiasco::parse(&container, &config)
                .with_context(|| format!("parsing container {}", container.display()))?;
            let written = fiasco.unpack(dir.as_deref())?;
            for path in &written {
                println!("{}", path.display());
            }
        }

        Command::Info { file } => {
            let mut head = [0u8; 1];
            use std::io::Read as _;
            File::open(&file)
                .and_then(|mut f| f.read(&mut head))
                .with_context(|| format!("reading {}", file.display()))?;
            if head[0] == FIASCO_SIGNATURE {
                let container = Fiasco::parse(&file, &config)?;
                print!("{}", container.to_text());
            } else {
                let image = Image::from_file(&file, ImageMeta::default(), &config)?;
                print!("{}", image.to_text());
            }
        }
    }

    Ok(())
}
