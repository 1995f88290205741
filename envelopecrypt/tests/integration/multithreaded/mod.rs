mod session_concurrency_test;
