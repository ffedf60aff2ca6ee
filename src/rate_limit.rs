//! Sliding-window admission control, per tool and global.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

/// Length of the sliding window.
pub const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    Tool,
    Global,
}

/// Rejection from [`RateLimiter::check_limit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimited {
    pub tool: String,
    pub scope: LimitScope,
    pub limit: u32,
    pub retry_after: Duration,
}

impl fmt::Display for RateLimited {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = match self.scope {
            LimitScope::Tool => "",
            LimitScope::Global => " across all tools",
        };
        write!(
            f,
            "rate limit exceeded for {} ({}/min{}); retry in {}s",
            self.tool,
            self.limit,
            scope,
            self.retry_after.as_secs().max(1)
        )
    }
}

impl std::error::Error for RateLimited {}

#[derive(Default)]
struct Windows {
    global: VecDeque<Instant>,
    per_tool: HashMap<String, VecDeque<Instant>>,
}

fn purge(window: &mut VecDeque<Instant>, now: Instant) {
    while let Some(front) = window.front() {
        if now.saturating_duration_since(*front) >= WINDOW {
            window.pop_front();
        } else {
            break;
        }
    }
}

fn retry_after(window: &VecDeque<Instant>, now: Instant) -> Duration {
    window
        .front()
        .map(|t| WINDOW.saturating_sub(now.saturating_duration_since(*t)))
        .unwrap_or_default()
}

pub struct RateLimiter {
    settings: RwLock<RateLimitConfig>,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitConfig) -> Self {
        Self {
            settings: RwLock::new(settings),
            windows: Mutex::new(Windows::default()),
        }
    }

    /// Swap limits without touching recorded timestamps.
    pub fn update_settings(&self, settings: RateLimitConfig) {
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
    }

    pub fn check_limit(&self, tool: &str) -> Result<(), RateLimited> {
        self.check_at(tool, Instant::now())
    }

    /// Admit or reject one call at `now`. Admission records the call in
    /// both windows; rejection records nothing.
    pub fn check_at(&self, tool: &str, now: Instant) -> Result<(), RateLimited> {
        let (tool_limit, global_limit) = {
            let settings = self.settings.read().unwrap_or_else(|e| e.into_inner());
            (settings.limit_for(tool), settings.global_per_minute)
        };

        let mut guard = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let windows = &mut *guard;
        purge(&mut windows.global, now);
        let per_tool = windows.per_tool.entry(tool.to_string()).or_default();
        purge(per_tool, now);

        if per_tool.len() >= tool_limit as usize {
            return Err(RateLimited {
                tool: tool.to_string(),
                scope: LimitScope::Tool,
                limit: tool_limit,
                retry_after: retry_after(per_tool, now),
            });
        }
        if windows.global.len() >= global_limit as usize {
            return Err(RateLimited {
                tool: tool.to_string(),
                scope: LimitScope::Global,
                limit: global_limit,
                retry_after: retry_after(&windows.global, now),
            });
        }
        per_tool.push_back(now);
        windows.global.push_back(now);
        Ok(())
    }

    /// Calls recorded for `tool` in the current window.
    pub fn in_window(&self, tool: &str) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows
            .per_tool
            .get_mut(tool)
            .map(|w| {
                purge(w, now);
                w.len()
            })
            .unwrap_or(0)
    }
}
