fn main() {
    if let Err(err) = cooperson::cli::run_cooperson() {
        tracing::error!(error = %err, "cooperson failed");
        std::process::exit(1);
    }
}
