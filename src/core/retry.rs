//! 通用重试策略：指数退避 + 随机抖动
//!
//! retry 包装任意可失败的异步操作；错误类型通过 Retryable 自行声明是否可重试，
//! 以及服务端建议的等待时长（如 429 的 retry-after）。不可重试的错误立即透传。

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

/// 退避参数；各字段与 config [retry] 段一一对应
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 首次失败后最多再试几次
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

/// 错误自描述：是否值得用同样的请求重试，以及服务端给出的等待提示
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    /// 服务端建议的重试间隔（如 retry-after 头）；大于计算出的退避时则优先采用
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// 重试包装的失败结果
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// 重试次数耗尽；携带总尝试次数与最后一次底层错误
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// 不可重试的错误，原样透传
    #[error("{0}")]
    Aborted(E),
}

/// 第 attempt 次失败后的退避时长：min(max, initial * multiplier^attempt + 至多 10% 抖动)
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.initial_delay.as_millis() as f64
        * config.backoff_multiplier.powi(attempt as i32);
    let jitter = base * 0.1 * rand::thread_rng().gen::<f64>();
    let capped = (base + jitter).min(config.max_delay.as_millis() as f64);
    Duration::from_millis(capped as u64)
}

/// 执行 op；失败且可重试时按退避休眠后再试，直到成功或次数耗尽
pub async fn retry<T, E, F, Fut>(config: &RetryConfig, mut op: F) -> Result<T, RetryError<E>>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_retryable() => return Err(RetryError::Aborted(e)),
            Err(e) => {
                if attempt >= config.max_retries {
                    return Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        last: e,
                    });
                }
                let mut delay = backoff_delay(config, attempt);
                if let Some(hint) = e.retry_after() {
                    delay = delay.max(hint);
                }
                tracing::warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retryable failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct FakeError {
        retryable: bool,
    }

    impl std::fmt::Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "fake (retryable={})", self.retryable)
        }
    }

    impl Retryable for FakeError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry(&fast_config(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(FakeError { retryable: true })
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_propagates_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = retry(&fast_config(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FakeError { retryable: false }) }
        })
        .await;
        assert!(matches!(result, Err(RetryError::Aborted(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_carries_attempt_count() {
        let result: Result<u32, _> = retry(&fast_config(), || async {
            Err(FakeError { retryable: true })
        })
        .await;
        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 4),
            other => panic!("expected Exhausted, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let config = RetryConfig {
            max_retries: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            backoff_multiplier: 2.0,
        };
        // 100 * 2^5 远超上限，封顶 400ms
        let d = backoff_delay(&config, 5);
        assert_eq!(d, Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_delay_grows() {
        let config = fast_config();
        let d0 = backoff_delay(&config, 0);
        assert!(d0 >= Duration::from_millis(1));
        let d2 = backoff_delay(&config, 2);
        assert!(d2 >= Duration::from_millis(4));
    }
}
