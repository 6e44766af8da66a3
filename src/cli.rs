use clap::Parser;
use std::path::PathBuf;

// Every field is optional so that the configuration layer can tell an
// explicit flag apart from a default and apply CLI > INI > defaults.
#[derive(Parser, Clone, Debug, Default)]
#[command(
    name = "zipdrop",
    version,
    about = "A small HTTP service that accepts ZIP archive uploads and stores them on disk.",
    long_about = "A small HTTP service that accepts ZIP archive uploads and stores them on disk.\n\
                  Clients POST a multipart/form-data body with a single `file` field to /api/upload.\n\
                  Only parts declared as application/zip or application/x-zip-compressed are accepted,\n\
                  files are streamed to disk in chunks and never buffered whole, and every stored file\n\
                  is named <stem>_<milliseconds><extension> inside the upload directory.\n\
                  Settings can also come from an INI file (zipdrop.ini, zipdrop.conf,\n\
                  ~/.config/zipdrop/config.ini or /etc/zipdrop/config.ini); flags win over the file."
)]
pub struct Cli {
    /// Host address to listen on
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Port number to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of worker threads
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Directory uploaded files are written to (created at startup)
    #[arg(short = 'd', long)]
    pub upload_dir: Option<PathBuf>,

    /// Maximum accepted file size in MB
    #[arg(short = 'm', long, value_parser = validate_upload_size)]
    pub max_file_size: Option<u64>,

    /// Size of the buffer used to stream uploads to disk, in bytes
    #[arg(short, long)]
    pub chunk_size: Option<usize>,

    /// Seconds a stalled upload may stay silent before it is treated as an
    /// abort (0 disables the timeout)
    #[arg(long)]
    pub read_timeout: Option<u64>,

    /// Send permissive CORS headers and answer preflight requests
    #[arg(long)]
    pub cors: Option<bool>,

    /// Enable verbose logging (log level: debug)
    #[arg(short, long)]
    pub verbose: Option<bool>,

    /// Enable detailed logging (log level: info)
    #[arg(long)]
    pub detailed_logging: Option<bool>,

    /// Configuration file path (INI format)
    #[arg(long, value_parser = validate_config_file)]
    pub config_file: Option<String>,
}

/// Upload ceiling must stay within 1..=10240 MB
fn validate_upload_size(s: &str) -> Result<u64, String> {
    let size: u64 = s
        .parse()
        .map_err(|_| "Upload size must be a positive number".to_string())?;

    if size == 0 {
        return Err("Upload size must be greater than 0 MB".to_string());
    }

    if size > 10240 {
        return Err("Upload size must not exceed 10240 MB (10 GB)".to_string());
    }

    Ok(size)
}

fn validate_config_file(s: &str) -> Result<String, String> {
    if s.is_empty() {
        return Err("Config file path cannot be empty".to_string());
    }

    let path = PathBuf::from(s);
    if !path.exists() {
        return Err(format!("Config file does not exist: {s}"));
    }
    if !path.is_file() {
        return Err(format!("Config path is not a file: {s}"));
    }

    match std::fs::File::open(&path) {
        Ok(_) => Ok(s.to_string()),
        Err(e) => Err(format!("Cannot read config file {s}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_validate_upload_size() {
        assert_eq!(validate_upload_size("1").unwrap(), 1);
        assert_eq!(validate_upload_size("800").unwrap(), 800);
        assert_eq!(validate_upload_size("10240").unwrap(), 10240);

        assert!(validate_upload_size("0").is_err());
        assert!(validate_upload_size("10241").is_err());
        assert!(validate_upload_size("-1").is_err());
        assert!(validate_upload_size("abc").is_err());
    }

    #[test]
    fn test_validate_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("zipdrop.ini");
        std::fs::write(&file, "[server]\nport=1\n").unwrap();

        assert!(validate_config_file(&file.to_string_lossy()).is_ok());
        assert!(validate_config_file("").is_err());
        assert!(validate_config_file("/nonexistent/zipdrop.ini").is_err());
        assert!(validate_config_file(&temp_dir.path().to_string_lossy()).is_err());
    }

    #[test]
    fn test_flags_parse() {
        let cli = Cli::try_parse_from([
            "zipdrop",
            "--port",
            "4000",
            "--upload-dir",
            "/tmp/up",
            "--max-file-size",
            "5",
            "--cors",
            "false",
        ])
        .unwrap();

        assert_eq!(cli.port, Some(4000));
        assert_eq!(cli.upload_dir, Some(PathBuf::from("/tmp/up")));
        assert_eq!(cli.max_file_size, Some(5));
        assert_eq!(cli.cors, Some(false));
        assert_eq!(cli.listen, None);
        assert!(Cli::try_parse_from(["zipdrop", "--max-file-size", "0"]).is_err());
    }
}
