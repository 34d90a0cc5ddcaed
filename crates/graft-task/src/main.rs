use std::env;
use std::fs;
use std::io::stderr;
use std::path::{Path, PathBuf};
use std::process::exit;

use serde::{Deserialize, Serialize};
use tracing_appender::{non_blocking, rolling::never};
use tracing_subscriber::{EnvFilter, fmt::layer, layer::SubscriberExt, util::SubscriberInitExt};

use graft_core::{ImportConfig, SQLiteOptions, SourceFormat, task_dir};

mod import;

/// 操作类型
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Import, // CSV/JSON Lines -> SQLite
}

/// 导入任务配置
#[derive(Debug, Deserialize)]
pub struct ImportTaskConfig {
    pub file: String,
    #[serde(default = "default_format")]
    pub format: SourceFormat,
    pub database: SQLiteOptions,
    /// 超过该时长的任务在块边界中止
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub options: ImportConfig,
}

fn default_format() -> SourceFormat {
    SourceFormat::Csv
}

fn default_owner() -> String {
    "graft-task".into()
}

/// 统一的任务配置
#[derive(Debug, Deserialize)]
pub struct TaskConfig {
    pub task_id: String,
    #[serde(default = "default_owner")]
    pub owner: String,
    pub operation: Operation,
    pub created_at: String,

    #[serde(default)]
    pub import: Option<ImportTaskConfig>,
}

/// 进度输出消息（写入 stdout 的 JSON Lines）
#[derive(Debug, Serialize)]
pub struct ProgressMessage {
    kind: MessageKind,
    data: serde_json::Value,
}

/// 消息类型
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Progress,
    Status,
    Error,
    Completed,
}

/// 初始化任务日志系统
///
/// stdout 只输出进度消息，日志写到 stderr 和任务目录下的 task.log。
fn init_task_logging(task_dir: &Path) -> non_blocking::WorkerGuard {
    let log_file = never(task_dir, "task.log");
    let (non_blocking, guard) = non_blocking(log_file);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(layer().with_writer(stderr))
        .with(layer().with_writer(non_blocking).with_ansi(false))
        .init();

    guard
}

fn parse_task_dir(args: &[String]) -> Option<PathBuf> {
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--task-dir" => return iter.next().map(PathBuf::from),
            "--task-id" => return iter.next().map(|id| task_dir(id)),
            _ => {}
        }
    }
    None
}

/// 读取并解析任务目录下的 config.json
fn load_task(task_dir: &Path) -> Result<TaskConfig, String> {
    let path = task_dir.join("config.json");
    let content = fs::read_to_string(&path).map_err(|e| format!("无法读取配置文件 {}: {}", path.display(), e))?;
    serde_json::from_str(&content).map_err(|e| format!("配置文件格式错误: {}", e))
}

fn main() {
    // 1. 解析命令行参数
    let args: Vec<String> = env::args().collect();
    let task_dir = match parse_task_dir(&args) {
        Some(dir) => dir,
        None => {
            print_error("fatal", "缺少 --task-dir 或 --task-id 参数");
            eprintln!("用法: graft-task --task-dir <DIR> | --task-id <ID>");
            exit(1);
        }
    };

    // 2. 初始化日志系统
    let log_guard = init_task_logging(&task_dir);
    tracing::info!("任务进程启动，task_dir: {:?}", task_dir);

    // 3. 读取任务配置
    let config = match load_task(&task_dir) {
        Ok(cfg) => cfg,
        Err(message) => {
            print_error("fatal", &message);
            exit(1);
        }
    };
    tracing::info!("任务配置解析成功: task_id={}, created_at={}", config.task_id, config.created_at);

    // 4. 根据 operation 分发处理
    let code = match config.operation {
        Operation::Import => match config.import.as_ref() {
            Some(import_config) => import::run(&config, import_config),
            None => {
                print_error("fatal", "Import 配置缺失");
                1
            }
        },
    };

    drop(log_guard);
    exit(code);
}

impl ProgressMessage {
    pub fn new(
        kind: MessageKind,
        data: serde_json::Value,
    ) -> Self {
        Self { kind, data }
    }

    /// 以单行 JSON 写到 stdout
    pub fn print(&self) {
        match serde_json::to_string(self) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!("进度消息序列化失败: {}", e),
        }
    }
}

pub fn print_error(
    severity: &str,
    message: &str,
) {
    ProgressMessage::new(MessageKind::Error, serde_json::json!({ "severity": severity, "message": message })).print();
}

pub fn print_completed(data: serde_json::Value) {
    ProgressMessage::new(MessageKind::Completed, data).print();
}
