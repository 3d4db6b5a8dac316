use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::trace;
use crate::unix_now;

/// 保留的最近错误条数
pub const MAX_LAST_ERRORS: usize = 20;

const DEFAULT_CATEGORY: &str = "default";
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferErrorRecord {
    pub ts: u64,
    pub category: String,
    pub text_log: String,
}

/// 统计变化事件，供外部 PWA 消费者订阅
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Error { category: String, text: String },
    Success { category: String },
}

#[derive(Debug, Default)]
struct StatsInner {
    last_errors: VecDeque<TransferErrorRecord>,
    failing: BTreeSet<String>,
}

/// 按分类记录转发成功与失败，可跨 worker 共享
#[derive(Debug, Clone)]
pub struct TransferStats {
    inner: Arc<Mutex<StatsInner>>,
    events: broadcast::Sender<TransferEvent>,
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

fn category_name(category: &str) -> String {
    if category.trim().is_empty() {
        DEFAULT_CATEGORY.to_string()
    } else {
        category.to_string()
    }
}

impl TransferStats {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(StatsInner::default())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, StatsInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // 没有订阅者时 send 返回错误，忽略即可
    fn publish(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }

    pub fn save_error(&self, category: &str, text: &str) {
        let category = category_name(category);
        {
            let mut inner = self.lock();
            inner.last_errors.push_back(TransferErrorRecord {
                ts: unix_now(),
                category: category.clone(),
                text_log: text.to_string(),
            });
            while inner.last_errors.len() > MAX_LAST_ERRORS {
                inner.last_errors.pop_front();
            }
            inner.failing.insert(category.clone());
        }
        trace!("Transfer error saved for category {}", category);
        self.publish(TransferEvent::Error {
            category,
            text: text.to_string(),
        });
    }

    pub fn save_success(&self, category: &str) {
        let category = category_name(category);
        self.lock().failing.remove(&category);
        trace!("Transfer success saved for category {}", category);
        self.publish(TransferEvent::Success { category });
    }

    pub fn save_success_all(&self) {
        let cleared: Vec<String> = std::mem::take(&mut self.lock().failing).into_iter().collect();
        for category in cleared {
            self.publish(TransferEvent::Success { category });
        }
    }

    /// 最近的错误，从旧到新
    pub fn last_errors(&self, include_text: bool) -> Vec<TransferErrorRecord> {
        self.lock()
            .last_errors
            .iter()
            .map(|record| TransferErrorRecord {
                text_log: if include_text {
                    record.text_log.clone()
                } else {
                    String::new()
                },
                ..record.clone()
            })
            .collect()
    }

    pub fn error_categories(&self) -> Vec<String> {
        self.lock().failing.iter().cloned().collect()
    }
}
