//! Usage: Run blocking (sqlite / filesystem) work off the async runtime.

pub(crate) async fn run<T, F>(label: &'static str, f: F) -> Result<T, String>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, String> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(err) => Err(format!("SYSTEM_ERROR: blocking task {label} failed: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::run;

    #[tokio::test]
    async fn run_returns_closure_result() {
        let value = run("unit", || Ok::<_, String>(41 + 1)).await;
        assert_eq!(value, Ok(42));

        let err = run("unit", || Err::<(), _>("boom".to_string())).await;
        assert_eq!(err, Err("boom".to_string()));
    }

    #[tokio::test]
    async fn run_reports_panicking_task_with_label() {
        let err = run("exploding", || -> Result<(), String> { panic!("kaboom") })
            .await
            .unwrap_err();
        assert!(err.starts_with("SYSTEM_ERROR: blocking task exploding failed"));
    }
}
