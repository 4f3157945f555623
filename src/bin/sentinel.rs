/// 数字卫兵 (Digital Sentinel)
///
/// 场景监控组合根:
/// 1. 采集循环: 读取帧 (限速 / 突发模式)
/// 2. 帧处理引擎: 检测 → 跟踪 → 照片保存 (工作线程池)
/// 3. 场景匹配: 周期性分析静止目标布局
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use scene_sentinel::detection::types::{WORKING_HEIGHT, WORKING_WIDTH};
use scene_sentinel::{
    CancellationToken, DetectionModel, EventSink, Frame, FrameProcessor, ObjectTracker, ReplayModel,
    SceneMatcher, SentinelConfig, TracingSink,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// 数字卫兵参数
#[derive(Parser, Debug)]
#[command(author, version, about = "数字卫兵 - 目标跟踪与场景识别", long_about = None)]
struct Args {
    /// 配置文件 (不存在时写出默认配置)
    #[arg(short, long, default_value = "sentinel.json")]
    config: PathBuf,

    /// 帧图像目录 (按文件名排序); 不指定时使用空白帧
    #[arg(short, long)]
    frames: Option<PathBuf>,

    /// 录制的检测结果 (JSON)
    #[arg(short, long)]
    detections: PathBuf,

    /// 工作线程数 (覆盖配置)
    #[arg(short, long)]
    workers: Option<usize>,

    /// 场景数据库路径 (覆盖配置)
    #[arg(long)]
    db: Option<PathBuf>,

    /// 照片输出目录 (覆盖配置)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// 目标帧率
    #[arg(long, default_value_t = 5.0)]
    fps: f64,

    /// 突发模式: 有新目标进入时不限速
    #[arg(long, default_value_t = false)]
    burst: bool,

    /// 处理帧数上限 (不指定则直到 Ctrl+C; 帧目录在读完后循环)
    #[arg(long)]
    max_frames: Option<u64>,

    /// JSON 日志输出
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("scene_sentinel=info,sentinel=info"));

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(true))
            .with(env_filter)
            .init();
    }
}

/// 帧来源: 目录中的图像 (循环) 或空白帧
struct FrameSource {
    paths: Vec<PathBuf>,
    cursor: usize,
}

impl FrameSource {
    fn open(dir: Option<&Path>) -> Result<Self> {
        let mut paths = Vec::new();
        if let Some(dir) = dir {
            for entry in fs::read_dir(dir).with_context(|| format!("读取帧目录失败: {}", dir.display()))? {
                let path = entry?.path();
                let is_image = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false);
                if is_image {
                    paths.push(path);
                }
            }
            paths.sort();
            anyhow::ensure!(!paths.is_empty(), "帧目录中没有图像: {}", dir.display());
        }
        Ok(Self { paths, cursor: 0 })
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if self.paths.is_empty() {
            return Ok(Frame::blank(WORKING_WIDTH, WORKING_HEIGHT));
        }
        let path = &self.paths[self.cursor % self.paths.len()];
        self.cursor += 1;
        let image = image::open(path)
            .with_context(|| format!("读取帧失败: {}", path.display()))?
            .to_rgb8();
        Ok(Frame::new(image))
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    // ========== 配置 ==========
    let mut config = SentinelConfig::load(&args.config);
    if let Some(workers) = args.workers {
        config.engine.workers = workers;
    }
    if let Some(db) = &args.db {
        config.scene.db_path = db.clone();
    }
    if let Some(output_dir) = &args.output_dir {
        config.engine.output_dir = output_dir.clone();
    }
    config.validate().context("配置无效")?;
    config.log_summary();

    // ========== 组合根 ==========
    let model = Arc::new(ReplayModel::load(&args.detections)?);
    model.warm_up()?;
    info!(model = %model.name(), frames = model.len(), "detection model ready");

    let events: Arc<dyn EventSink> = Arc::new(TracingSink);
    let tracker = Arc::new(std::sync::Mutex::new(ObjectTracker::new(config.tracker.clone())));
    let processor = FrameProcessor::new(model, Arc::clone(&tracker), Arc::clone(&events), config.engine.clone())
        .context("创建帧处理引擎失败")?;
    let mut matcher = SceneMatcher::open(config.scene.clone(), Arc::clone(&events))
        .context("打开场景数据库失败")?;

    let token = CancellationToken::new();
    token.cancel_on_signals()?;

    let mut source = FrameSource::open(args.frames.as_deref())?;
    let frame_interval = Duration::from_secs_f64(1.0 / args.fps.max(0.1));
    let analysis_interval = config.scene.analysis_interval();
    let mut last_analysis = Instant::now();
    let mut frame_count = 0u64;

    info!(parallel = processor.is_parallel(), "system ready, monitoring started");

    // ========== 采集循环 ==========
    while !token.is_cancelled() {
        if args.max_frames.is_some_and(|max| frame_count >= max) {
            break;
        }
        let loop_start = Instant::now();

        let frame = source.next_frame()?;
        let mut handle = processor.submit_frame(&frame);
        frame_count += 1;
        if let Some(result) = handle.try_result() {
            if !result.processed {
                warn!(frame = frame_count, queue = processor.queue_len(), "frame not processed");
            }
        }

        // 场景观察 (静止目标快照)
        let (stationary, fresh_entry) = {
            let tracker = tracker.lock().unwrap_or_else(PoisonError::into_inner);
            (tracker.stationary_objects(), tracker.has_fresh_entry())
        };
        matcher.update_observation(&stationary, &frame);

        if last_analysis.elapsed() >= analysis_interval {
            last_analysis = Instant::now();
            // 识别/新建结果经事件输出
            matcher.analyze_and_persist_scene();
        }

        // 突发模式: 有新目标进入时不限速
        if args.burst && fresh_entry {
            continue;
        }
        if let Some(remaining) = frame_interval.checked_sub(loop_start.elapsed()) {
            token.sleep(remaining);
        }
    }

    // ========== 关闭 ==========
    info!("shutting down...");
    processor.shutdown();
    let stats = processor.stats();
    info!(
        frames = frame_count,
        processed = stats.processed,
        dropped = stats.dropped,
        failed = stats.failed,
        photos = stats.photos_saved,
        scenes = matcher.scene_count(),
        "sentinel stopped"
    );
    Ok(())
}
