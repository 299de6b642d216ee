//! CLI arguments and server configuration defaults.

use clap::Parser;
use std::path::PathBuf;

use crate::extensions::{DEFAULT_ALLOWED_EXTENSIONS, ExtensionPolicy};

pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_TEMP_TTL_SECS: u64 = 60 * 60;
pub const TEMP_CLEAN_INTERVAL_SECS: u64 = 900;
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "quickdrop", version, about = "LAN file drop server")]
pub struct Args {
    #[arg(
        short = 'd',
        long,
        env = "QUICKDROP_UPLOAD_DIR",
        default_value = "uploads",
        help = "Directory uploaded files are stored in"
    )]
    pub upload_dir: PathBuf,
    #[arg(
        short = 'm',
        long,
        env = "QUICKDROP_MAX_FILE_SIZE",
        default_value_t = DEFAULT_MAX_FILE_SIZE,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Max upload request size in bytes"
    )]
    pub max_file_size: u64,
    #[arg(
        short = 'e',
        long,
        env = "QUICKDROP_ALLOWED_EXTENSIONS",
        default_value = DEFAULT_ALLOWED_EXTENSIONS,
        value_delimiter = ',',
        help = "Comma separated list of allowed file extensions"
    )]
    pub allowed_extensions: Vec<String>,
    #[arg(
        short = 'b',
        long = "bind",
        env = "QUICKDROP_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "QUICKDROP_PORT",
        default_value_t = DEFAULT_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(long, env = "QUICKDROP_LOG_FILE", help = "Also append logs to this file")]
    pub log_file: Option<PathBuf>,
    #[arg(
        long,
        env = "QUICKDROP_TEMP_TTL_SECS",
        default_value_t = DEFAULT_TEMP_TTL_SECS,
        help = "Age after which leftover temp files are removed (0 to disable)"
    )]
    pub temp_ttl_secs: u64,
}

/// 启动后不可变的运行配置，通过 `Extension` 共享给各处理器。
#[derive(Clone, Debug)]
pub struct Settings {
    /// 规范化后的上传根目录。
    pub upload_dir: PathBuf,
    pub max_file_size: u64,
    pub extensions: ExtensionPolicy,
    pub port: u16,
}

impl Settings {
    pub fn new(args: &Args, upload_dir: PathBuf) -> Self {
        Self {
            upload_dir,
            max_file_size: args.max_file_size,
            extensions: ExtensionPolicy::new(&args.allowed_extensions),
            port: args.port,
        }
    }
}
