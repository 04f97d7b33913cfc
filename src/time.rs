// ============================================================================
// src/time.rs - Timer Interface and Bounded Waits
// ============================================================================
//!
//! タイマー境界と、管理ステータス待ちに使う「有界スリープ + 定期再確認」。
//!
//! 割り込み駆動のスリープFutureはカーネル側（タイマー割り込み -> Waker）が
//! 提供する。ここではその口だけを受け取る。

use alloc::boxed::Box;
use core::future::Future;
use core::pin::Pin;

/// タイマー
pub trait Timer: Send + Sync {
    /// 単調増加する現在時刻（ミリ秒）
    fn now_ms(&self) -> u64;

    /// 指定ミリ秒スリープする
    fn sleep_ms(&self, duration_ms: u64) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// 待ち結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    /// 条件が成立した
    Ready(T),
    /// 期限切れ
    TimedOut,
}

/// `poll` が `Some` を返すまで、`interval_ms` 毎に再確認する
///
/// 期限は `timeout_ms`。スリープの前に必ず一度確認するので、
/// 既に条件が成立していればスリープしない。
pub async fn wait_until<T, F>(timer: &dyn Timer, timeout_ms: u64, interval_ms: u64, mut poll: F) -> WaitOutcome<T>
where
    F: FnMut() -> Option<T>,
{
    let deadline = timer.now_ms().saturating_add(timeout_ms);
    loop {
        if let Some(value) = poll() {
            return WaitOutcome::Ready(value);
        }
        let now = timer.now_ms();
        if now >= deadline {
            return WaitOutcome::TimedOut;
        }
        timer.sleep_ms(interval_ms.min(deadline - now).max(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTimer;

    #[test]
    fn test_wait_until_ready_without_sleep() {
        let timer = MockTimer::new();
        let outcome = pollster::block_on(wait_until(&timer, 100, 10, || Some(7)));
        assert_eq!(outcome, WaitOutcome::Ready(7));
        assert_eq!(timer.now_ms(), 0);
    }

    #[test]
    fn test_wait_until_times_out() {
        let timer = MockTimer::new();
        let outcome: WaitOutcome<()> = pollster::block_on(wait_until(&timer, 100, 30, || None));
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(timer.now_ms(), 100);
    }

    #[test]
    fn test_wait_until_ready_after_some_sleeps() {
        let timer = MockTimer::new();
        let mut calls = 0;
        let outcome = pollster::block_on(wait_until(&timer, 1000, 10, || {
            calls += 1;
            if calls == 4 { Some(calls) } else { None }
        }));
        assert_eq!(outcome, WaitOutcome::Ready(4));
        assert_eq!(timer.now_ms(), 30);
    }
}
