use clap::{Parser, Subcommand};
use crust_xfer::criu::image::ImageDir;
use crust_xfer::criu::image_desc::CrFdType;
use crust_xfer::criu::log::log_init;
use crust_xfer::criu::options::{opts, opts_init, XferOpts, DEFAULT_RELAY_TIMEOUT};
use crust_xfer::criu::page_server::cr_page_server;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "crust-xfer")]
#[command(about = "criu page transfer in rust", long_about = None)]
struct Args {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write log to FILE ("-" for stdout)
    #[arg(short = 'o', long = "log-file", value_name = "FILE", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Receive pages from a dumping peer and write them as images
    PageServer {
        /// Directory to write images into
        #[arg(short = 'D', long, value_name = "DIR")]
        images_dir: PathBuf,

        /// Address to listen on (all interfaces by default)
        #[arg(long)]
        address: Option<String>,

        #[arg(long)]
        port: u16,

        /// Seconds to wait for in-flight pages
        #[arg(long, value_name = "SECS", default_value_t = DEFAULT_RELAY_TIMEOUT.as_secs())]
        timeout: u64,
    },

    /// Print a pagemap image
    Show {
        #[arg(short = 'D', long, value_name = "DIR")]
        images_dir: PathBuf,

        /// Read pagemap-shmem-ID.img instead of pagemap-ID.img
        #[arg(long)]
        shmem: bool,

        id: i64,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    log_init(args.log_file.as_deref(), args.verbose)?;

    match args.command {
        Command::PageServer {
            images_dir,
            address,
            port,
            timeout,
        } => {
            let _ = opts_init(XferOpts {
                use_page_server: false,
                addr: address,
                port,
                imgs_dir: images_dir,
                relay_timeout: Duration::from_secs(timeout),
                verbose: args.verbose,
                log_file: args.log_file.clone(),
            });

            log::info!("Image directory: {}", opts().imgs_dir.display());
            let stats = cr_page_server(opts())?;
            log::info!("Received {} pages", stats.pages);
        }
        Command::Show {
            images_dir,
            shmem,
            id,
        } => {
            let dir = ImageDir::open(&images_dir)?;
            let fd_type = if shmem {
                CrFdType::ShmemPagemap
            } else {
                CrFdType::Pagemap
            };

            let pagemap = dir.read_pagemap(fd_type, id)?;
            pagemap.display();

            let pages = dir.read_pages(pagemap.pages_id)?;
            log::info!("pages-{}.img: {} bytes", pagemap.pages_id, pages.len());
        }
    }

    Ok(())
}
