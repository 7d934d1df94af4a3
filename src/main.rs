use clap::{Parser, Subcommand};
use foldersync_lib::core::{
    analyze_folder, FileOutcome, FolderLocks, MetadataStore, PolicyResolver, SyncPolicy,
};
use foldersync_lib::{logging, KeyringSecretStore, ProgressEvent, SyncEngine, SyncSession, SyncWorker};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::sync::mpsc;

/// 文件夹同步到对象存储
#[derive(Parser)]
#[command(name = "foldersync", version)]
#[command(about = "Sync watched folders to object storage with per-file policies")]
struct Cli {
    /// 配置目录（默认为平台配置目录下的 foldersync）
    #[arg(long, env = "FOLDERSYNC_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 执行一轮同步
    Sync {
        folder: PathBuf,
        /// 存储配置名
        #[arg(long, env = "FOLDERSYNC_PROFILE", default_value = "default")]
        profile: String,
    },
    /// 显示各文件的策略和同步状态
    Status { folder: PathBuf },
    /// 设置文件或目录的同步策略
    Policy {
        folder: PathBuf,
        path: String,
        /// mirrored | remote-only | excluded
        policy: SyncPolicy,
    },
    /// 清除本地已不存在的文件的同步记录
    Clear { folder: PathBuf, path: String },
    /// 从对象存储取回文件
    Restore {
        folder: PathBuf,
        path: String,
        #[arg(long, env = "FOLDERSYNC_PROFILE", default_value = "default")]
        profile: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let session = match &cli.config_dir {
        Some(dir) => SyncSession::from_dir(dir),
        None => SyncSession::load(),
    };
    let session = match session {
        Ok(s) => s,
        Err(e) => {
            eprintln!("初始化失败: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init(session.config_dir());

    match run(cli.command, &session).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("错误: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn connect(session: &SyncSession, profile: &str) -> anyhow::Result<SyncEngine> {
    session.connect(profile, &KeyringSecretStore::new()).await
}

async fn run(command: Commands, session: &SyncSession) -> anyhow::Result<bool> {
    match command {
        Commands::Sync { folder, profile } => {
            let engine = connect(session, &profile).await?;
            sync(engine, folder).await
        }
        Commands::Status { folder } => {
            status(session, &folder).await?;
            Ok(true)
        }
        Commands::Policy {
            folder,
            path,
            policy,
        } => {
            let _guard = FolderLocks::acquire_standalone(&folder)?;
            MetadataStore::open(&folder)?.set_policy(path.trim_matches('/'), policy)?;
            println!("{} -> {}", path, policy);
            Ok(true)
        }
        Commands::Clear { folder, path } => {
            let _guard = FolderLocks::acquire_standalone(&folder)?;
            let cleared = MetadataStore::open(&folder)?.clear_record(path.trim_matches('/'))?;
            if cleared {
                println!("已清除: {}", path);
            } else {
                println!("未清除（无记录或文件仍存在）: {}", path);
            }
            Ok(cleared)
        }
        Commands::Restore {
            folder,
            path,
            profile,
        } => {
            connect(session, &profile)
                .await?
                .restore(&folder, &path)
                .await?;
            println!("已恢复: {}", path);
            Ok(true)
        }
    }
}

async fn sync(engine: SyncEngine, folder: PathBuf) -> anyhow::Result<bool> {
    let worker = SyncWorker::spawn(engine);
    let (progress_tx, mut progress_rx) = mpsc::channel(256);
    let result_rx = worker.trigger(folder, Some(progress_tx))?;

    let renderer = tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            render(&event);
        }
    });

    let mut result_rx = result_rx;
    let result = tokio::select! {
        result = &mut result_rx => result?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("正在取消，当前文件完成后停止...");
            worker.cancel();
            result_rx.await?
        }
    };
    let _ = renderer.await;
    worker.shutdown().await?;

    println!(
        "{:?}: 扫描 {}, 上传 {}, 本地删除 {}, 跳过 {}, 未变化 {}, 失败 {}",
        result.outcome,
        result.scanned,
        result.uploaded,
        result.deleted_locally,
        result.skipped_no_sync,
        result.up_to_date,
        result.errored
    );
    if let Some(message) = &result.message {
        println!("  {}", message);
    }
    for e in &result.errors {
        println!("  失败 {}: {}", e.path, e.message);
    }
    for issue in &result.health_issues {
        println!("  注意 {}: {}", issue.path, issue.message);
    }
    Ok(result.is_success())
}

fn render(event: &ProgressEvent) {
    match event {
        ProgressEvent::PassStarted { total } => println!("共 {} 个文件", total),
        ProgressEvent::FileStarted { index, total, path } => {
            println!("[{}/{}] {}", index + 1, total, path)
        }
        ProgressEvent::Transfer {
            bytes_transferred,
            bytes_total,
            ..
        } if *bytes_total > 0 => {
            eprint!("\r  {}%", bytes_transferred * 100 / bytes_total);
            if bytes_transferred >= bytes_total {
                eprintln!();
            }
        }
        ProgressEvent::FileFinished { outcome, .. } => match outcome {
            FileOutcome::UpToDate | FileOutcome::Skipped | FileOutcome::Vanished => {}
            FileOutcome::Errored { message } | FileOutcome::DeleteFailed { message, .. } => {
                println!("  失败: {}", message)
            }
            other => println!("  {:?}", other),
        },
        _ => {}
    }
}

async fn status(session: &SyncSession, folder: &Path) -> anyhow::Result<()> {
    let stats = analyze_folder(folder, &session.config().scan).await?;
    println!(
        "文件 {}: 待同步 {}, 已同步 {}, 排除 {}",
        stats.total_files, stats.needs_sync, stats.synced, stats.excluded
    );

    let metadata = MetadataStore::open(folder)?;
    let resolver = PolicyResolver::new(metadata.records());
    for (path, record) in metadata.records() {
        let state = record
            .state
            .map(|s| format!("{:?}", s))
            .unwrap_or_else(|| "-".to_string());
        let synced_at = record
            .synced_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<40} {:<12} {:<20} {}",
            path,
            resolver.effective_policy(path).to_string(),
            state,
            synced_at
        );
    }
    Ok(())
}
