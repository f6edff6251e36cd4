/// 数字卫兵 (Digital Sentinel)
///
/// 智能视频监控系统
///
/// 系统架构:
/// 1. 采集线程: 每路摄像头读帧 + 合成叠加层
/// 2. 检测线程: 每路摄像头人脸识别 / 危险物品 / 打架检测
/// 3. 主线程:   配置、状态输出、MJPEG 录制
///
/// 直接运行: cargo run --bin sentinel --release -- --config sentinel.json
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use sentinel_rs::detection::{NullDetector, NullRecognizer};
use sentinel_rs::stream::MjpegStream;
use sentinel_rs::{AlertStatus, Sentinel, SentinelConfig};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// 数字卫兵参数
#[derive(Parser, Debug)]
#[command(author, version, about = "数字卫兵 - 智能视频监控系统", long_about = None)]
struct Args {
    /// 配置文件 (不存在时写入默认配置)
    #[arg(short, long, default_value = "sentinel.json")]
    config: PathBuf,

    /// 运行时长 (秒), 不指定则一直运行
    #[arg(long)]
    run_secs: Option<u64>,

    /// 把主画面录制为 MJPEG 文件
    #[arg(long)]
    mjpeg_out: Option<PathBuf>,

    /// 启动后模拟一次告警, 例如 "Fire"
    #[arg(long)]
    simulate: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = SentinelConfig::load(&args.config);

    tracing::info!("✅ 数字卫兵启动 | {} 路摄像头", config.cameras.len());
    tracing::warn!("⚠️  未接入推理后端, 使用空识别器/检测器 (只采集与合成)");

    let sentinel = Arc::new(Sentinel::bootstrap(
        config,
        Arc::new(NullRecognizer),
        Arc::new(NullDetector),
    )?);

    for cam in sentinel.list_cameras() {
        tracing::info!("📷 [{}] {} | 主画面: {} | 在线: {}", cam.id, cam.label, cam.main, cam.live);
    }

    if let Some(threat) = &args.simulate {
        let alert = sentinel.simulate_threat(threat);
        tracing::warn!("🚨 {}", alert.message);
    }

    let deadline = args.run_secs.map(|s| Instant::now() + Duration::from_secs(s));
    let expired = move || deadline.is_some_and(|d| Instant::now() >= d);

    let recorder = match (&args.mjpeg_out, sentinel.main_camera()) {
        (Some(path), Some(camera)) => {
            let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
            let path = path.clone();
            Some(thread::spawn(move || {
                let mut stream = MjpegStream::new(camera, BufWriter::new(file));
                match stream.pump(None, expired) {
                    Ok(n) => tracing::info!("💾 MJPEG 已写入 {} ({} 帧)", path.display(), n),
                    Err(e) => tracing::error!("❌ MJPEG 录制失败: {:#}", e),
                }
            }))
        }
        (Some(_), None) => {
            tracing::warn!("⚠️  没有可用的主画面, 跳过 MJPEG 录制");
            None
        }
        _ => None,
    };

    let mut ticks = 0u64;
    while !expired() {
        thread::sleep(Duration::from_secs(1));
        ticks += 1;
        if ticks % 10 == 0 {
            let stats = sentinel.stats();
            tracing::info!(
                "📊 已知 {} | 陌生 {} | 嫌疑 {} | 总计 {}",
                stats.known,
                stats.unknown,
                stats.suspects,
                stats.traffic
            );
        }
        if let AlertStatus::Active(alert) = sentinel.alert_status() {
            tracing::warn!("🚨 {} | {}", alert.threat, alert.message);
        }
    }

    if let Some(handle) = recorder {
        let _ = handle.join();
    }
    sentinel.shutdown();
    Ok(())
}
