use std::env;
use std::path::PathBuf;

fn fallback_dotenv_path(vault_home: Option<PathBuf>, home_dir: Option<PathBuf>) -> Option<PathBuf> {
    match (vault_home, home_dir) {
        (Some(vault_home), _) => Some(vault_home.join(".env")),
        (None, Some(home)) => Some(home.join("courtvault/.env")),
        (None, None) => None,
    }
}

pub fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    let fallback = fallback_dotenv_path(
        env::var_os("COURTVAULT_HOME").map(PathBuf::from),
        dirs::home_dir(),
    );

    let Some(path) = fallback else {
        return;
    };
    if path.is_file() {
        let _ = dotenvy::from_path(&path);
    }
}

#[cfg(test)]
mod tests {
    use super::fallback_dotenv_path;
    use std::path::PathBuf;

    #[test]
    fn fallback_prefers_vault_home() {
        let got = fallback_dotenv_path(
            Some(PathBuf::from("/srv/vault")),
            Some(PathBuf::from("/home/alice")),
        );
        assert_eq!(got, Some(PathBuf::from("/srv/vault/.env")));
    }

    #[test]
    fn fallback_uses_home_when_vault_home_unset() {
        let got = fallback_dotenv_path(None, Some(PathBuf::from("/home/alice")));
        assert_eq!(got, Some(PathBuf::from("/home/alice/courtvault/.env")));
    }
}
