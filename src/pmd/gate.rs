//! open/release 簿记.
//!
//! 与分发路径使用不同的锁 (可阻塞的 std Mutex), 两把锁从不嵌套.

use std::sync::{Mutex, MutexGuard};

use log::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    NoCurrentDevice,
    DeviceCurrent,
}

#[derive(Debug, Default)]
struct GateState {
    /// 当前被视为 "打开" 的设备 (minor)
    current: Option<u32>,
    openers: usize,
}

#[derive(Debug, Default)]
pub struct OpenGate {
    state: Mutex<GateState>,
}

impl OpenGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        // 簿记只有两个字段, 持锁线程 panic 后状态仍然可用
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 总是成功
    pub fn open(&self, minor: u32) {
        info!("pmd_open called");
        let mut state = self.lock();
        state.openers += 1;
        state.current = Some(minor);
    }

    /// 总是成功; 没有 current 设备时立即返回.
    ///
    /// release 不会解除映射也不会回收 Backing Store, 映射一直保留到 teardown.
    pub fn release(&self) {
        let mut state = self.lock();
        let Some(minor) = state.current else {
            return;
        };
        state.openers = state.openers.saturating_sub(1);
        if state.openers == 0 {
            state.current = None;
            debug!("PMD: minor {} released, backing store stays mapped", minor);
        }
    }

    #[allow(unused)]
    pub fn status(&self) -> GateStatus {
        match self.lock().current {
            Some(_) => GateStatus::DeviceCurrent,
            None => GateStatus::NoCurrentDevice,
        }
    }
}
