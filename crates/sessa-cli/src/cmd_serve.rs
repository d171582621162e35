use sessa_serve::ServeConfig;
use sessa_store::SessaConfig;

pub fn execute(config: &SessaConfig, bind: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let serve = ServeConfig {
        db_path: config.db_path.clone(),
        bind: bind.unwrap_or_else(|| config.bind.clone()),
        port: port.unwrap_or(config.port),
        auth_disabled: config.auth_disabled,
    };
    tokio::runtime::Runtime::new()?.block_on(sessa_serve::serve(serve))
}
