//! 来源防护
//!
//! 按来源IP跟踪关联协商失败次数。窗口内失败次数达到上限的来源
//! 被暂时封禁，封禁期间的关联请求在协商前直接以暂时拒绝回应，
//! 不再触发注册表查询。协商成功会清除该来源的失败记录。

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct SourceEntry {
    failures: u32,
    window_start: Instant,
    blocked_until: Option<Instant>,
}

/// 按来源IP的失败计数器与封禁表
///
/// 锁只在内存表操作期间持有，从不跨越网络I/O。
pub struct SourceGuard {
    max_failures: u32,
    window: Duration,
    block_duration: Duration,
    entries: Mutex<HashMap<IpAddr, SourceEntry>>,
}

impl SourceGuard {
    pub fn new(max_failures: u32, window: Duration, block_duration: Duration) -> Self {
        Self {
            max_failures,
            window,
            block_duration,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// 来源当前是否处于封禁期，过期的封禁顺带清除
    pub fn is_blocked(&self, source: IpAddr) -> bool {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        if let Some(entry) = entries.get(&source) {
            if let Some(until) = entry.blocked_until {
                if now < until {
                    return true;
                }
                entries.remove(&source);
            }
        }
        false
    }

    /// 登记一次协商失败，窗口内达到上限即封禁
    pub fn record_failure(&self, source: IpAddr) {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        let entry = entries.entry(source).or_insert(SourceEntry {
            failures: 0,
            window_start: now,
            blocked_until: None,
        });
        if now.duration_since(entry.window_start) > self.window {
            entry.failures = 0;
            entry.window_start = now;
        }
        entry.failures += 1;
        if entry.failures >= self.max_failures {
            entry.blocked_until = Some(now + self.block_duration);
            warn!(
                "来源封禁: ip={}, 窗口内失败{}次, 封禁{}秒",
                source,
                entry.failures,
                self.block_duration.as_secs()
            );
        } else {
            debug!("协商失败计数: ip={}, 次数={}", source, entry.failures);
        }
    }

    /// 协商成功，清除该来源的失败记录
    pub fn record_success(&self, source: IpAddr) {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.remove(&source);
    }
}
