pub mod torrent;

#[cfg(test)]
pub mod testing {
    use log::LevelFilter;
    use log4rs::append::console::ConsoleAppender;
    use log4rs::config::{Appender, Logger, Root};
    use log4rs::encode::pattern::PatternEncoder;
    use log4rs::Config;
    use std::future::Future;
    use std::sync::Once;
    use std::time::Duration;

    static INIT: Once = Once::new();

    /// Initializes the logger with the specified log level.
    #[macro_export]
    macro_rules! init_logger {
        ($level:expr) => {
            crate::testing::init_logger_level($level)
        };
        () => {
            crate::testing::init_logger_level(log::LevelFilter::Trace)
        };
    }

    /// Initializes the logger with the specified log level.
    pub fn init_logger_level(level: LevelFilter) {
        INIT.call_once(|| {
            log4rs::init_config(
                Config::builder()
                    .appender(Appender::builder().build(
                        "stdout",
                        Box::new(
                            ConsoleAppender::builder()
                                .encoder(Box::new(PatternEncoder::new(
                                    "{d(%Y-%m-%d %H:%M:%S%.3f)} {h({l:>5.5})} --- [{T:>15.15}] {t:<50.50} : {m}{n}",
                                )))
                                .build(),
                        ),
                    ))
                    .logger(Logger::builder().build("httpmock", LevelFilter::Info))
                    .logger(Logger::builder().build("hyper", LevelFilter::Info))
                    .logger(Logger::builder().build("reqwest", LevelFilter::Info))
                    .logger(Logger::builder().build("tracing", LevelFilter::Info))
                    .build(Root::builder().appender("stdout").build(level))
                    .unwrap(),
            )
            .unwrap();
        })
    }

    /// Await the given future, or panic if the timeout is reached.
    #[macro_export]
    macro_rules! timeout {
        ($future:expr, $timeout:expr) => {
            crate::testing::timeout($future, $timeout, "operation timed out").await
        };
        ($future:expr, $timeout:expr, $message:expr) => {
            crate::testing::timeout($future, $timeout, $message).await
        };
    }

    /// Await the given future, or panic with the given message if the timeout is reached.
    pub async fn timeout<F: Future>(future: F, timeout: Duration, message: &str) -> F::Output {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => panic!("operation timed-out, {}", message),
            result = future => result,
        }
    }
}
