use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use bootimg_assembler::config::AssemblerConfig;
use bootimg_assembler::report::{RepackReport, write_json_report};
use bootimg_assembler::tools::{HostToolLocator, Tool, ToolLocator};
use bootimg_assembler::{Assembler, Error, Result, bootconfig};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Assembler config TOML (tool locations, signing, ramdisk settings)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Swap the kernel of a boot image, keeping its ramdisk and cmdline
    RepackBoot {
        #[arg(long)]
        kernel: PathBuf,
        #[arg(long)]
        boot_image: PathBuf,
        #[arg(long)]
        output: PathBuf,
        /// Staging dir for the unpacked image
        #[arg(long)]
        build_dir: PathBuf,
        /// Write a JSON report of the commit outcome
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Rebuild a vendor boot image, optionally replacing its kernel modules
    RepackVendorBoot {
        #[arg(long)]
        vendor_boot_image: PathBuf,
        #[arg(long)]
        output: PathBuf,
        /// Staging dir, reused across runs
        #[arg(long)]
        unpack_dir: PathBuf,
        /// Kernel modules ramdisk appended after the stripped vendor ramdisk
        #[arg(long, conflicts_with = "empty_ramdisk")]
        ramdisk: Option<PathBuf>,
        /// Strip lib/modules without adding replacement modules
        #[arg(long)]
        empty_ramdisk: bool,
        /// Target has a dedicated bootconfig section
        #[arg(long)]
        bootconfig_supported: bool,
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Build a combined initrd with a bootconfig trailer
    Gem5Initrd {
        #[arg(long)]
        initrd: PathBuf,
        #[arg(long)]
        persistent_bootconfig: PathBuf,
        /// Dir holding both the unpacked boot and vendor boot images
        #[arg(long)]
        unpack_dir: PathBuf,
        #[arg(long)]
        ramdisk: Option<PathBuf>,
    },
    /// Print the Android OS version recorded in a boot image
    OsVersion {
        #[arg(long)]
        boot_image: PathBuf,
    },
    /// Verify and print the bootconfig trailer at the end of a file
    InspectBootconfig { file: PathBuf },
    /// Show where each host tool resolves to
    Tools,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.log_json);
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(kind = ?e.kind(), exit_code = ?e.exit_code(), "{e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8, json: bool) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> Result<AssemblerConfig> {
    match path {
        Some(p) => AssemblerConfig::load(p),
        None => Ok(AssemblerConfig::default()),
    }
}

fn run(args: Args) -> Result<()> {
    let cfg = load_config(args.config.as_deref())?;
    match args.cmd {
        Command::RepackBoot {
            kernel,
            boot_image,
            output,
            build_dir,
            report,
        } => {
            let asm = Assembler::from_config(cfg);
            let r = asm.repack_boot_image(&kernel, &boot_image, &output, &build_dir)?;
            finish(r, report.as_deref())
        }
        Command::RepackVendorBoot {
            vendor_boot_image,
            output,
            unpack_dir,
            ramdisk,
            empty_ramdisk,
            bootconfig_supported,
            report,
        } => {
            let asm = Assembler::from_config(cfg);
            let r = if empty_ramdisk {
                asm.repack_vendor_boot_image_with_empty_ramdisk(
                    &vendor_boot_image,
                    &output,
                    &unpack_dir,
                    bootconfig_supported,
                )?
            } else {
                asm.repack_vendor_boot_image(
                    ramdisk.as_deref(),
                    &vendor_boot_image,
                    &output,
                    &unpack_dir,
                    bootconfig_supported,
                )?
            };
            finish(r, report.as_deref())
        }
        Command::Gem5Initrd {
            initrd,
            persistent_bootconfig,
            unpack_dir,
            ramdisk,
        } => Assembler::from_config(cfg).repack_gem5_boot_image(
            &initrd,
            &persistent_bootconfig,
            &unpack_dir,
            ramdisk.as_deref(),
        ),
        Command::OsVersion { boot_image } => {
            let version = Assembler::from_config(cfg).read_android_version(&boot_image)?;
            println!("{version}");
            Ok(())
        }
        Command::InspectBootconfig { file } => cmd_inspect_bootconfig(&file),
        Command::Tools => {
            let locator = HostToolLocator::from_config(&cfg.tools);
            for tool in Tool::ALL {
                println!("{:<16} {}", tool.name(), locator.locate(tool)?.display());
            }
            Ok(())
        }
    }
}

fn finish(report: RepackReport, report_path: Option<&Path>) -> Result<()> {
    println!(
        "{} {} ({:?}, sha256 {})",
        report.image,
        report.output.display(),
        report.outcome,
        report.sha256
    );
    if let Some(p) = report_path {
        write_json_report(p, std::slice::from_ref(&report))?;
    }
    Ok(())
}

fn cmd_inspect_bootconfig(path: &Path) -> Result<()> {
    let raw = std::fs::read(path).map_err(|e| Error::io("read", path, e))?;
    let parsed = bootconfig::parse_trailer(&raw)?;
    println!("size: {}", parsed.size);
    println!("checksum: {:#010x}", parsed.checksum);
    print!("{}", String::from_utf8_lossy(parsed.config));
    Ok(())
}
