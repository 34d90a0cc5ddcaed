use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use serde::{Deserialize, Serialize};

use crate::job::JobStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Started,
    ChunkCommitted,
    Paused,
    Resumed,
    Finished,
    Aborted,
    Failed,
}

/// 任务进度快照，每个块提交后以及生命周期变化时发出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: String,
    pub kind: EventKind,
    pub status: JobStatus,
    pub rows_read: u64,
    pub rows_committed: u64,
    pub chunks_committed: u64,
    pub chunk_elapsed_millis: u64,
    pub total_elapsed_millis: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub trait ProgressListener: Send {
    fn on_event(
        &self,
        event: &ProgressEvent,
    );
}

impl<F> ProgressListener for F
where
    F: Fn(&ProgressEvent) + Send,
{
    fn on_event(
        &self,
        event: &ProgressEvent,
    ) {
        self(event)
    }
}

enum Message {
    Event(ProgressEvent),
    Subscribe(Box<dyn ProgressListener>),
    Flush(Sender<()>),
}

/// 进度分发器
///
/// `emit` 只是向通道发送消息，从不阻塞提交循环；监听器在独立线程中按发出顺序被调用。
#[derive(Clone)]
pub struct ProgressReporter {
    sender: Sender<Message>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name("graft-progress".into())
            .spawn(move || dispatch(receiver));
        if let Err(err) = spawned {
            tracing::error!("进度分发线程启动失败，进度事件将被丢弃: {}", err);
        }
        Self { sender }
    }

    pub fn subscribe(
        &self,
        listener: impl ProgressListener + 'static,
    ) {
        let _ = self.sender.send(Message::Subscribe(Box::new(listener)));
    }

    pub fn emit(
        &self,
        event: ProgressEvent,
    ) {
        if self.sender.send(Message::Event(event)).is_err() {
            tracing::debug!("进度分发线程已退出，事件被丢弃");
        }
    }

    /// 等待此前发出的事件全部分发完毕
    pub fn flush(&self) {
        let (tx, rx) = mpsc::channel();
        if self.sender.send(Message::Flush(tx)).is_ok() {
            let _ = rx.recv();
        }
    }
}

fn dispatch(receiver: Receiver<Message>) {
    let mut listeners: Vec<Box<dyn ProgressListener>> = Vec::new();

    for message in receiver {
        match message {
            Message::Subscribe(listener) => listeners.push(listener),
            Message::Flush(done) => {
                let _ = done.send(());
            }
            Message::Event(event) => {
                for listener in &listeners {
                    let delivered = catch_unwind(AssertUnwindSafe(|| listener.on_event(&event)));
                    if delivered.is_err() {
                        tracing::error!("任务 {} 的进度监听器发生 panic，已忽略", event.job_id);
                    }
                }
            }
        }
    }
}
