use crate::domain::model::ItemCode;
use crate::utils::error::{ImportError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// 狀態圖：只能向前移動，終止狀態不可離開
    pub fn can_transition_to(self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Running, Cancelled)
                | (Paused, Cancelled)
                | (Running, Failed)
                | (Paused, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 呼叫端寫入的控制訊號，由 worker 在項目之間套用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchControl {
    Pause,
    Resume,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Created,
    Updated,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub code: String,
    pub outcome: ItemOutcome,
    pub catalog_id: Option<u64>,
    pub attempts: u32,
    pub message: Option<String>,
    #[serde(default)]
    pub error_kind: Option<String>,
}

impl ItemResult {
    pub fn completed(code: &ItemCode, outcome: ItemOutcome, catalog_id: Option<u64>, attempts: u32) -> Self {
        Self {
            code: code.to_string(),
            outcome,
            catalog_id,
            attempts,
            message: None,
            error_kind: None,
        }
    }

    /// 失敗的項目；`code` 可能是無法解析的原始輸入
    pub fn failed(code: &str, error: &ImportError, attempts: u32) -> Self {
        Self {
            code: code.to_string(),
            outcome: ItemOutcome::Failed,
            catalog_id: None,
            attempts,
            message: Some(error.to_string()),
            error_kind: Some(error.kind().to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub code: String,
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingItem {
    pub code: ItemCode,
    pub attempts: u32,
}

/// 持久化的批次工作紀錄；只有處理該批次的 worker 會修改計數器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub batch_id: String,
    pub kind: String,
    pub item_codes: Vec<ItemCode>,
    pub status: BatchStatus,
    pub force_update: bool,
    pub processed: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub current_code: Option<ItemCode>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub pending: VecDeque<PendingItem>,
    pub per_item_results: Vec<ItemResult>,
    pub errors: VecDeque<ErrorLogEntry>,
    /// 已完成項目的累計處理時間，用來推估 ETA
    pub busy_millis: u64,
}

impl BatchJob {
    /// 建立新批次；重複的代碼只保留第一次出現
    pub fn new(batch_id: String, kind: &str, codes: Vec<ItemCode>, force_update: bool) -> Self {
        let mut unique: Vec<ItemCode> = Vec::with_capacity(codes.len());
        for code in codes {
            if !unique.contains(&code) {
                unique.push(code);
            }
        }
        let pending = unique
            .iter()
            .cloned()
            .map(|code| PendingItem { code, attempts: 0 })
            .collect();
        let now = Utc::now();

        Self {
            batch_id,
            kind: kind.to_string(),
            item_codes: unique,
            status: BatchStatus::Idle,
            force_update,
            processed: 0,
            success: 0,
            failed: 0,
            skipped: 0,
            current_code: None,
            started_at: now,
            updated_at: now,
            finished_at: None,
            failure_reason: None,
            pending,
            per_item_results: Vec::new(),
            errors: VecDeque::new(),
            busy_millis: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.item_codes.len() + self.rejected_inputs()
    }

    // 建立時即被判定為無效的輸入不在 item_codes 內，但仍計入 processed
    fn rejected_inputs(&self) -> usize {
        self.per_item_results
            .iter()
            .filter(|r| ItemCode::parse(&r.code).is_err())
            .count()
    }

    pub fn remaining(&self) -> usize {
        self.total().saturating_sub(self.processed)
    }

    pub fn transition(&mut self, next: BatchStatus, action: &str) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ImportError::InvalidTransition {
                from: self.status.to_string(),
                action: action.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next.is_terminal() {
            self.finished_at = Some(self.updated_at);
            self.current_code = None;
        }
        Ok(())
    }

    pub fn record_outcome(&mut self, result: ItemResult) {
        match result.outcome {
            ItemOutcome::Created | ItemOutcome::Updated => self.success += 1,
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Failed => self.failed += 1,
        }
        self.processed += 1;
        self.per_item_results.push(result);
        self.updated_at = Utc::now();
    }

    /// 有上限的錯誤紀錄，超過上限時丟棄最舊的
    pub fn log_error(&mut self, code: &str, error: &ImportError, cap: usize) {
        if cap == 0 {
            return;
        }
        while self.errors.len() >= cap {
            self.errors.pop_front();
        }
        self.errors.push_back(ErrorLogEntry {
            code: code.to_string(),
            kind: error.kind().to_string(),
            message: error.to_string(),
            at: Utc::now(),
        });
    }

    /// 所有實際處理過的項目都以同一種錯誤失敗（不含建立時就被拒絕的輸入）
    pub fn all_failed_with(&self, kind: &str) -> bool {
        let mut processed = self
            .per_item_results
            .iter()
            .filter(|r| ItemCode::parse(&r.code).is_ok())
            .peekable();
        processed.peek().is_some()
            && processed.all(|r| r.error_kind.as_deref() == Some(kind))
    }

    pub fn counters_consistent(&self) -> bool {
        self.processed == self.success + self.failed + self.skipped
    }

    pub fn elapsed(&self) -> Duration {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).to_std().unwrap_or_default()
    }

    /// 以已完成項目的平均耗時推估剩餘時間；建立時被拒絕的輸入沒有耗時，不列入平均
    pub fn eta(&self) -> Option<Duration> {
        let finished = self.processed.saturating_sub(self.rejected_inputs());
        if finished == 0 || self.status.is_terminal() {
            return None;
        }
        let per_item = self.busy_millis / finished as u64;
        Some(Duration::from_millis(per_item * self.remaining() as u64))
    }

    pub fn progress(&self) -> BatchProgress {
        BatchProgress {
            batch_id: self.batch_id.clone(),
            status: self.status,
            total: self.total(),
            processed: self.processed,
            success: self.success,
            failed: self.failed,
            skipped: self.skipped,
            current_code: self.current_code.as_ref().map(|c| c.to_string()),
            elapsed: self.elapsed(),
            eta: self.eta(),
        }
    }
}

/// 每個項目完成後送出的進度快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_id: String,
    pub status: BatchStatus,
    pub total: usize,
    pub processed: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub current_code: Option<String>,
    pub elapsed: Duration,
    pub eta: Option<Duration>,
}

impl BatchProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.processed as f64 * 100.0 / self.total as f64
    }
}
