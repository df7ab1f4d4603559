mod global_mode_test;
mod local_mode_test;
