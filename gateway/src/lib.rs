// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

pub mod config;
pub mod deposit;
pub mod error;
pub mod events;
pub mod gateway;
pub mod log_feed;
pub mod metrics;
pub mod subscription;
pub mod transaction;
pub mod types;

#[cfg(test)]
pub mod test_utils;

pub use gateway::{ChainGateway, ChainResources};

#[macro_export]
macro_rules! retry_with_max_elapsed_time {
    ($func:expr, $max_elapsed_time:expr) => {{
        // The following delay sequence (in secs) will be used, applied with jitter
        // 0.4, 0.8, 1.6, 3.2, 6.4, 12.8, 25.6, 30, 60, 120, 120 ...
        let backoff = backoff::ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(400),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: std::time::Duration::from_secs(120),
            max_elapsed_time: Some($max_elapsed_time),
            ..Default::default()
        };
        backoff::future::retry(backoff, || {
            let fut = async {
                let result = $func.await;
                match result {
                    Ok(_) => {
                        return Ok(result);
                    }
                    Err(e) => {
                        // Every error is treated as transient until max_elapsed_time
                        tracing::debug!("Retrying due to error: {:?}", e);
                        return Err(backoff::Error::transient(e));
                    }
                }
            };
            std::boxed::Box::pin(fut)
        })
        .await
    }};
}
