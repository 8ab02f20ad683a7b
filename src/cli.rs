use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{BufReader, stdin, stdout};
use tracing::info;

use shotwatch::CaptureService;
use shotwatch::config::{Config, init};
use shotwatch::rpc;

#[derive(Parser)]
#[command(name = "shotwatch")]
#[command(about = "截图目录监视工具", long_about = None)]
#[command(version)]
pub struct Cli {
    /// 配置文件路径(默认位于用户配置目录)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// 日志等级 (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// 数据目录,覆盖配置中的 storage.data_dir
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 启动守护进程,通过 stdin/stdout 收发 JSON 行
    Serve,

    /// 打印当前设置
    Settings,

    /// 列出历史记录
    List {
        /// 省略缩略图数据
        #[arg(long)]
        no_thumbnails: bool,
    },

    /// 修改保存目录
    SetDir {
        /// 新的保存目录(必须存在且可写)
        path: PathBuf,
    },

    /// 把保存目录中尚未入库的图片补进历史
    Rescan,
}

/// CLI 入口函数
pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init::init(&config.logging);

    match cli.command {
        Commands::Serve => serve(config).await?,
        Commands::Settings => {
            let service = CaptureService::open(&config)?;
            print_json(&service.get_settings())?;
        }
        Commands::List { no_thumbnails } => {
            let service = CaptureService::open(&config)?;
            let mut images = service.get_saved_images();
            if no_thumbnails {
                for image in &mut images {
                    image.thumbnail.clear();
                }
            }
            print_json(&images)?;
        }
        Commands::SetDir { path } => {
            let service = CaptureService::open(&config)?;
            let settings = service.set_save_dir(path).await?;
            service.shutdown().await;
            print_json(&settings)?;
        }
        Commands::Rescan => {
            let service = CaptureService::open(&config)?;
            let added = service.rescan().await?;
            println!("Added {} images", added);
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::default_config_path()?,
    };
    let mut config = Config::load_or_default(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

/// 运行守护进程,直到输入关闭或收到 Ctrl-C
async fn serve(config: Config) -> Result<()> {
    let service = Arc::new(CaptureService::open(&config)?);
    service.restore().await;
    info!("shotwatch ready, data dir {}", config.storage.data_dir.display());

    tokio::select! {
        result = rpc::serve(service.clone(), BufReader::new(stdin()), stdout()) => {
            result.context("RPC loop failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C");
        }
    }

    // 优雅关闭
    service.shutdown().await;
    info!("shotwatch exited");
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
