use crate::common::TestControl;
use std::time::Duration;

#[tokio::test]
async fn test_control_exits_cleanly_on_sigterm() {
    let mut control = TestControl::new().await;
    control.register("n1", "a").await;

    #[cfg(unix)]
    {
        let pid = control.process_mut().id();
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    {
        let _ = control.process_mut().kill();
    }

    let process = control.process_mut();
    let mut exit = None;
    for _ in 0..30 {
        if let Some(status) = process.try_wait().unwrap() {
            exit = Some(status);
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let status = exit.expect("control plane did not exit after SIGTERM");
    #[cfg(unix)]
    assert!(status.success(), "unexpected exit status {:?}", status);
}
