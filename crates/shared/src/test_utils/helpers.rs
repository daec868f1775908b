use std::sync::Once;

pub static INIT_TEST_ONCE: Once = Once::new();

/// One-time process setup for tests: `.env` files and logging.
#[macro_export]
macro_rules! setup_test {
    () => {{
        $crate::test_utils::helpers::INIT_TEST_ONCE.call_once(|| {
            $crate::env::load_optional_env_files();
            $crate::logging::configure_logging().unwrap();
        });
    }};
}
