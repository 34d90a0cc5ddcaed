use std::env;
use std::fs::create_dir_all;
use std::path::PathBuf;

/// 覆盖根目录的环境变量
pub const HOME_ENV: &str = "GRAFT_HOME";

/// graft 根目录：优先 `$GRAFT_HOME`，其次 `~/.graft`，都不可用时为 `./.graft`
pub fn root_dir() -> PathBuf {
    if let Some(home) = env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .map(|home| home.join(".graft"))
        .unwrap_or_else(|| PathBuf::from(".graft"))
}

/// 任务根目录（`<root>/tasks`），不存在时创建
pub fn tasks_dir() -> PathBuf {
    ensure(root_dir().join("tasks"))
}

/// 单个任务的目录（`<root>/tasks/{task_id}`），其中存放 config.json 与 task.log
pub fn task_dir(id: &str) -> PathBuf {
    ensure(tasks_dir().join(dir_name(id)))
}

/// 任务 ID 对应的目录名：路径分隔符与控制字符被替换，保证目录不会逃出任务根目录
fn dir_name(id: &str) -> String {
    let name: String = id
        .trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\') || c.is_control() { '_' } else { c })
        .collect();
    match name.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => name,
    }
}

fn ensure(dir: PathBuf) -> PathBuf {
    if let Err(err) = create_dir_all(&dir) {
        tracing::warn!("创建目录 {} 失败: {}", dir.display(), err);
    }
    dir
}
