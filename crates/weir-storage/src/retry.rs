/// Retries a fallible async expression with jittered exponential backoff.
#[macro_export]
macro_rules! retry {
    ($e:expr, $max_retries:expr, $base:expr, $max_delay:expr, |$err_var:ident| $error_handler:expr, $retry_if:expr) => {{
        use rand::Rng;
        use std::time::Duration;
        let mut retries: u32 = 0;
        loop {
            match $e {
                Ok(value) => break Ok(value),
                Err(e) => {
                    if retries < $max_retries && $retry_if(&e) {
                        retries += 1;
                        {
                            let $err_var = e;
                            $error_handler;
                        }
                        let tmp = $max_delay.min($base * (2u32.pow(retries)));
                        let backoff = tmp / 2
                            + Duration::from_micros(
                                rand::thread_rng()
                                    .gen_range(0..=(tmp.as_micros() as u64 / 2)),
                            );

                        tokio::time::sleep(backoff).await;
                    } else {
                        break Err(e);
                    }
                }
            }
        }
    }};

    ($e:expr, $max_retries:expr, $base:expr, $max_delay:expr, |$err_var:ident| $error_handler:expr) => {
        $crate::retry!(
            $e,
            $max_retries,
            $base,
            $max_delay,
            |$err_var| $error_handler,
            |_| true
        )
    };
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_retry_until_success() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, String> = retry!(
            {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(format!("attempt {n} failed"))
                } else {
                    Ok(n)
                }
            },
            5,
            Duration::from_millis(1),
            Duration::from_millis(4),
            |e| tracing::warn!("{}", e)
        );

        assert_eq!(result, Ok(2));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), &str> = retry!(
            {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err("nope")
            },
            2,
            Duration::from_millis(1),
            Duration::from_millis(2),
            |_e| (),
            |_: &&str| true
        );

        assert_eq!(result, Err("nope"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
