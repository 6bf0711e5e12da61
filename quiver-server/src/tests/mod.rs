mod backend_callback_tests;
mod test_utils;
