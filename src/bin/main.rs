use cowrite::{cli, config, server, telemetry};

fn main() {
    let cli = cli::parse_from(std::env::args_os());

    let mut config = match config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    };
    cli.apply_to(&mut config);

    telemetry::init(telemetry::TelemetryConfig::new(cli.verbose, &config.logging));

    let span = tracing::info_span!("server", port = config.server.port);
    let _guard = span.enter();

    if let Err(err) = server::run(config) {
        tracing::error!("fatal: {err}");
        std::process::exit(1);
    }
}
