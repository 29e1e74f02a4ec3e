use std::sync::atomic::{AtomicBool, Ordering};

/// 对象适配器句柄
///
/// 分发逻辑不在这里，连接只需要知道把请求交给谁，并且以身份（`Arc::ptr_eq`）比较。
#[derive(Debug)]
pub struct ObjectAdapter {
    name: String,
    deactivated: AtomicBool,
}

impl ObjectAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            deactivated: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 标记为已停用
    pub fn deactivate(&self) {
        self.deactivated.store(true, Ordering::SeqCst);
    }

    pub fn is_deactivated(&self) -> bool {
        self.deactivated.load(Ordering::SeqCst)
    }
}

impl std::fmt::Display for ObjectAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}
