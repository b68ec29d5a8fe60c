mod cli;
mod commands;
mod env_loader;
mod error;
mod logging;
mod vault;

fn main() {
    env_loader::load_dotenv();
    logging::init();

    if let Err(err) = cli::run() {
        match err.downcast_ref::<error::VaultError>() {
            Some(vault) => eprintln!("error[{}]: {err:#}", vault.code().as_str()),
            None => eprintln!("error: {err:#}"),
        }
        std::process::exit(1);
    }
}
