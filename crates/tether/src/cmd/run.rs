use tether::transport::{Endpoint, CHANNEL_FD_ENV};
use tether::{Worker, WorkerConfig};
use tracing::info;

use crate::cmd::RunArgs;
use crate::exit::{io_error, transport_error, worker_error, CliResult};
use crate::relay;

pub fn run(args: RunArgs) -> CliResult<i32> {
    let endpoint = Endpoint::from_vars(args.socket.clone(), std::env::var(CHANNEL_FD_ENV).ok())
        .map_err(|err| transport_error("cannot locate parent channel", err))?;
    let config = WorkerConfig {
        request_timeout: args.request_timeout,
        forced_exit_timeout: args.forced_exit_timeout,
        ..WorkerConfig::default()
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("failed to start async runtime", err))?;

    let result = runtime.block_on(async move {
        let (worker, driver) = Worker::connect(&endpoint, config)
            .await
            .map_err(|err| worker_error("failed to open parent channel", err))?;
        relay::install(&worker, args.input);

        let outcome = driver.run().await;
        info!(
            cause = %outcome.cause,
            forced = outcome.forced,
            exit_code = outcome.exit_code(),
            "exiting"
        );
        Ok(outcome.exit_code())
    });

    // A stdin read cannot be cancelled; don't wait on it.
    runtime.shutdown_background();
    result
}
