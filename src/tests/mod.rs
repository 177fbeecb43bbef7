mod buffer_pool_test;
mod merge_test;

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
