use std::path::PathBuf;

use anyhow::Result;
use clap::value_t_or_exit;
use thermal_roi::{arg, args_parser, opt};

pub struct Args {
    pub session: PathBuf,
    pub paths: Vec<String>,
    pub abort_on_error: bool,
    pub pretty: bool,
}

impl Args {
    pub fn from_cmd_line() -> Result<Args> {
        let matches = args_parser!("thermal-roi-stats")
            .about("Compute the ROI statistics of a session on many images.")
            .arg(
                opt!("session")
                    .short("s")
                    .required(true)
                    .help("Session file providing ROIs and the measurement environment"),
            )
            .arg(
                opt!("abort on error")
                    .takes_value(false)
                    .help("Stop processing further images after the first failure"),
            )
            .arg(
                opt!("pretty")
                    .short("p")
                    .takes_value(false)
                    .help("Pretty print the JSON output"),
            )
            .arg(
                arg!("paths")
                    .required(true)
                    .multiple(true)
                    .help("JSON files created with `exiftool -j -b`"),
            )
            .get_matches();

        let session = value_t_or_exit!(matches, "session", PathBuf);
        let paths = matches
            .values_of("paths")
            .map(|values| values.map(String::from).collect())
            .unwrap_or_default();

        Ok(Args {
            session,
            paths,
            abort_on_error: matches.is_present("abort on error"),
            pretty: matches.is_present("pretty"),
        })
    }
}
