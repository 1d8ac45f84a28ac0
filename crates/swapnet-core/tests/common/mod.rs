/// Poll a condition until it holds, failing the test after two seconds
macro_rules! eventually {
    ($what:expr, $cond:expr) => {{
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while !$cond {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {}", $what);
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }};
}
