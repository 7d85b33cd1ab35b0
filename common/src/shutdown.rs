use owo_colors::OwoColorize;

/// Resolves once the operator should stop: SIGINT from a terminal or the
/// SIGTERM the kubelet sends when the pod is deleted. Controllers race this
/// future and wind down at their next I/O boundary.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        let received = tokio::select! {
            _ = sigint.recv()  => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!(
            "{}",
            format!("🛑 Received {received}; shutting down").red()
        );
    }

    #[cfg(not(unix))]
    {
        // Non-Unix development hosts only get Ctrl+C.
        tokio::signal::ctrl_c()
            .await
            .expect("install Ctrl+C handler");
        eprintln!("{}", "🛑 Received Ctrl+C; shutting down".red());
    }
}
