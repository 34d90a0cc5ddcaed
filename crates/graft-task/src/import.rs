use std::io::{BufRead, stdin};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use graft_core::{
    EventKind, ImportRequest, Input, JobManager, JobSnapshot, JobStatus, ManagerConfig, ProgressEvent,
    ProgressReporter, SqliteGatewayFactory,
};

use crate::{ImportTaskConfig, MessageKind, ProgressMessage, TaskConfig, print_completed, print_error};

/// 导入任务（CSV/JSON Lines -> SQLite），返回进程退出码
pub fn run(
    task: &TaskConfig,
    config: &ImportTaskConfig,
) -> i32 {
    tracing::info!(
        "准备导入 {} ({}) 到 {}",
        config.file,
        config.format.label(),
        config.database.endpoint()
    );

    let reporter = ProgressReporter::new();
    reporter.subscribe(print_event);

    let manager_config = ManagerConfig {
        max_running: 1,
        job_timeout: config.timeout_seconds.map(Duration::from_secs),
        retention: None,
    };
    let factory = Arc::new(SqliteGatewayFactory::new(config.database.clone()));
    let manager = match JobManager::new(manager_config, factory, reporter) {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            print_error("fatal", &format!("任务管理器启动失败: {}", e));
            return 1;
        }
    };

    let request = ImportRequest {
        owner: task.owner.clone(),
        format: config.format,
        input: Input::path(&config.file),
        config: config.options.clone(),
    };
    let id = match manager.submit(request) {
        Ok(id) => id,
        Err(e) => {
            print_error("fatal", &e.to_string());
            return 1;
        }
    };
    tracing::info!("[{}] 任务 {} 已提交", id, task.task_id);

    listen_commands(manager.clone(), id.clone());

    let snapshot = loop {
        match manager.wait(&id, Duration::from_secs(60)) {
            Some(snapshot) if snapshot.status.is_terminal() => break snapshot,
            Some(_) => continue,
            None => {
                print_error("fatal", "任务记录丢失");
                return 1;
            }
        }
    };
    manager.reporter().flush();
    manager.shutdown();

    report(&snapshot)
}

fn report(snapshot: &JobSnapshot) -> i32 {
    let data = serde_json::to_value(snapshot).unwrap_or_default();
    match snapshot.status {
        JobStatus::Finished => {
            print_completed(data);
            0
        }
        JobStatus::Aborted => {
            print_completed(data);
            2
        }
        _ => {
            print_error("error", snapshot.last_error.as_deref().unwrap_or("任务失败"));
            print_completed(data);
            1
        }
    }
}

fn print_event(event: &ProgressEvent) {
    let kind = match event.kind {
        EventKind::ChunkCommitted => MessageKind::Progress,
        _ => MessageKind::Status,
    };
    ProgressMessage::new(kind, serde_json::to_value(event).unwrap_or_default()).print();
}

/// 从 stdin 读取控制命令：pause / resume / abort
fn listen_commands(
    manager: Arc<JobManager>,
    id: String,
) {
    let spawned = thread::Builder::new()
        .name("graft-commands".into())
        .spawn(move || {
            for line in stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                let result = match line.trim() {
                    "" => continue,
                    "pause" => manager.request_pause(&id),
                    "resume" => manager.request_resume(&id),
                    "abort" => manager.request_abort(&id),
                    other => {
                        tracing::warn!("未知命令: {}", other);
                        continue;
                    }
                };
                if let Err(e) = result {
                    tracing::warn!("[{}] 命令 {} 执行失败: {}", id, line.trim(), e);
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!("命令线程启动失败，任务将无法暂停或中止: {}", e);
    }
}
