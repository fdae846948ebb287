use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init_cli_logger(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("catalog_import=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("catalog_import=info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .init();
}

/// 排程模式下無人值守，輸出 JSON 方便收集
pub fn init_json_logger() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("catalog_import=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .json(),
        )
        .init();
}

pub type Fields<'a> = &'a [(&'a str, String)];

/// 帶欄位的日誌介面
pub trait EventLog: Send + Sync {
    fn debug(&self, message: &str, fields: Fields<'_>);
    fn info(&self, message: &str, fields: Fields<'_>);
    fn warn(&self, message: &str, fields: Fields<'_>);
    fn error(&self, message: &str, fields: Fields<'_>);
}

fn render(fields: Fields<'_>) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

/// 直接寫到 tracing 的根 logger
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLog;

impl EventLog for TracingLog {
    fn debug(&self, message: &str, fields: Fields<'_>) {
        tracing::debug!(context = %render(fields), "{}", message);
    }

    fn info(&self, message: &str, fields: Fields<'_>) {
        tracing::info!(context = %render(fields), "{}", message);
    }

    fn warn(&self, message: &str, fields: Fields<'_>) {
        tracing::warn!(context = %render(fields), "{}", message);
    }

    fn error(&self, message: &str, fields: Fields<'_>) {
        tracing::error!(context = %render(fields), "{}", message);
    }
}

/// 子 logger：持有上層 logger 與固定的上下文欄位，每次呼叫時合併後轉交
#[derive(Clone)]
pub struct ContextLogger {
    parent: Arc<dyn EventLog>,
    context: Vec<(String, String)>,
}

impl ContextLogger {
    pub fn new(parent: Arc<dyn EventLog>, context: Vec<(String, String)>) -> Self {
        Self { parent, context }
    }

    pub fn child(&self, extra: Vec<(String, String)>) -> Self {
        let mut context = self.context.clone();
        context.extend(extra);
        Self {
            parent: self.parent.clone(),
            context,
        }
    }

    pub fn context(&self) -> &[(String, String)] {
        &self.context
    }

    fn merged<'a>(&'a self, fields: Fields<'a>) -> Vec<(&'a str, String)> {
        // 呼叫端的欄位排在固定上下文之後
        self.context
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .chain(fields.iter().map(|(k, v)| (*k, v.clone())))
            .collect()
    }
}

impl EventLog for ContextLogger {
    fn debug(&self, message: &str, fields: Fields<'_>) {
        self.parent.debug(message, &self.merged(fields));
    }

    fn info(&self, message: &str, fields: Fields<'_>) {
        self.parent.info(message, &self.merged(fields));
    }

    fn warn(&self, message: &str, fields: Fields<'_>) {
        self.parent.warn(message, &self.merged(fields));
    }

    fn error(&self, message: &str, fields: Fields<'_>) {
        self.parent.error(message, &self.merged(fields));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        lines: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn push(&self, level: &str, message: &str, fields: Fields<'_>) {
            self.lines
                .lock()
                .unwrap()
                .push(format!("{} {} {}", level, message, render(fields)));
        }
    }

    impl EventLog for Recorder {
        fn debug(&self, message: &str, fields: Fields<'_>) {
            self.push("DEBUG", message, fields);
        }
        fn info(&self, message: &str, fields: Fields<'_>) {
            self.push("INFO", message, fields);
        }
        fn warn(&self, message: &str, fields: Fields<'_>) {
            self.push("WARN", message, fields);
        }
        fn error(&self, message: &str, fields: Fields<'_>) {
            self.push("ERROR", message, fields);
        }
    }

    #[test]
    fn test_context_logger_merges_fields() {
        let recorder = Arc::new(Recorder::default());
        let logger = ContextLogger::new(recorder.clone(), vec![("batch_id".into(), "b1".into())]);
        let child = logger.child(vec![("code".into(), "B000000001".into())]);

        child.warn("item failed", &[("attempt", "2".to_string())]);
        logger.info("started", &[]);

        let lines = recorder.lines.lock().unwrap();
        assert_eq!(lines[0], "WARN item failed batch_id=b1 code=B000000001 attempt=2");
        assert_eq!(lines[1], "INFO started batch_id=b1");
    }
}
