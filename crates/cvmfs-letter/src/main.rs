//! cvmfs-letter - sign and verify repository-bound letters.
//!
//! In sign mode, the message (from `-t` or the first line of stdin) is signed with the given
//! certificate and key, and the letter is printed.  In verify mode, the letter is checked
//! against the repository's whitelist and the local blacklist; the verified message is printed
//! on success.  The exit code says why verification failed.

use std::{
    io,
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};

use anyhow::{anyhow, Context};
use clap::{error::ErrorKind, Parser};
use log::{debug, warn};

use cvmfs_trust::{
    blacklist::{Blacklist, DEFAULT_BLACKLIST_PATH},
    fetch::HttpFetcher,
    hash::HashAlgorithm,
    letter::{self, LetterError},
    signature::{SignatureError, SignatureManager},
    trust::{TrustConfig, TrustContext, TrustFailure},
};

mod prompt;

const EXIT_USAGE: u8 = 1;
const EXIT_LOAD: u8 = 2;

/// Sign or verify a letter for a CernVM-FS repository.
#[derive(Parser, Debug)]
#[command(name = "cvmfs-letter", version, about)]
struct Args {
    /// Sign a letter.
    #[arg(short = 's', conflicts_with = "verify")]
    sign: bool,

    /// Verify a letter.
    #[arg(short = 'v')]
    verify: bool,

    /// Repository name (fqrn) the letter is bound to.
    #[arg(short = 'f', value_name = "FQRN")]
    fqrn: Option<String>,

    /// Private key (sign), or `:`-separated trusted public keys (verify).
    #[arg(short = 'k', value_name = "KEY")]
    key: Option<String>,

    /// Certificate matching the private key (sign).
    #[arg(short = 'c', value_name = "CERT")]
    certificate: Option<PathBuf>,

    /// Password of the private key (sign).  Prompted for if needed.
    #[arg(short = 'p', value_name = "PASSWORD")]
    password: Option<String>,

    /// Hash algorithm of the signature (sign).
    #[arg(short = 'a', value_name = "ALGORITHM", default_value_t = HashAlgorithm::default())]
    algorithm: HashAlgorithm,

    /// The message (sign) or letter (verify).  Read from stdin if not given.
    #[arg(short = 't', value_name = "TEXT")]
    text: Option<String>,

    /// Repository URL the whitelist is fetched from (verify).
    #[arg(short = 'r', value_name = "URL")]
    repository_url: Option<String>,

    /// Trusted CA certificates and CRLs (verify).
    #[arg(short = 'z', value_name = "BUNDLE")]
    ca_bundle: Option<PathBuf>,

    /// Maximum age of a letter in seconds (verify).
    #[arg(short = 'm', value_name = "SECONDS")]
    max_age: Option<u64>,

    /// Verify letters line by line until end of input (verify).
    #[arg(short = 'l')]
    repeat: bool,

    /// Local blacklist of revoked certificates (verify).
    #[arg(short = 'b', value_name = "PATH", default_value = DEFAULT_BLACKLIST_PATH)]
    blacklist: PathBuf,

    /// Whitelist download timeout in seconds (verify).
    #[arg(long, value_name = "SECONDS", default_value_t = 10)]
    timeout: u64,
}

#[derive(Debug)]
struct SignOptions {
    fqrn: String,
    key: PathBuf,
    certificate: PathBuf,
    password: Option<String>,
    algorithm: HashAlgorithm,
    text: Option<String>,
}

#[derive(Debug)]
struct VerifyOptions {
    fqrn: String,
    public_keys: Vec<PathBuf>,
    ca_bundle: Option<PathBuf>,
    repository_url: String,
    max_age: u64,
    repeat: bool,
    text: Option<String>,
    blacklist: PathBuf,
    timeout: Duration,
}

#[derive(Debug)]
enum Mode {
    Sign(SignOptions),
    Verify(VerifyOptions),
}

fn reject(present: bool, flag: &str, mode: &str) -> anyhow::Result<()> {
    if present {
        anyhow::bail!("{flag} can't be used when {mode}");
    }
    Ok(())
}

impl TryFrom<Args> for Mode {
    type Error = anyhow::Error;

    fn try_from(args: Args) -> anyhow::Result<Self> {
        let fqrn = args.fqrn.context("-f is required")?;

        if args.sign {
            reject(args.repository_url.is_some(), "-r", "signing")?;
            reject(args.ca_bundle.is_some(), "-z", "signing")?;
            reject(args.max_age.is_some(), "-m", "signing")?;
            reject(args.repeat, "-l", "signing")?;
            Ok(Mode::Sign(SignOptions {
                fqrn,
                key: args.key.context("-k is required when signing")?.into(),
                certificate: args.certificate.context("-c is required when signing")?,
                password: args.password,
                algorithm: args.algorithm,
                text: args.text,
            }))
        } else if args.verify {
            reject(args.certificate.is_some(), "-c", "verifying")?;
            reject(args.password.is_some(), "-p", "verifying")?;
            let public_keys: Vec<PathBuf> = args
                .key
                .iter()
                .flat_map(|keys| keys.split(':'))
                .filter(|path| !path.is_empty())
                .map(PathBuf::from)
                .collect();
            if public_keys.is_empty() && args.ca_bundle.is_none() {
                anyhow::bail!("-k or -z is required when verifying");
            }
            Ok(Mode::Verify(VerifyOptions {
                fqrn,
                public_keys,
                ca_bundle: args.ca_bundle,
                repository_url: args.repository_url.context("-r is required when verifying")?,
                max_age: args.max_age.context("-m is required when verifying")?,
                repeat: args.repeat,
                text: args.text,
                blacklist: args.blacklist,
                timeout: Duration::from_secs(args.timeout),
            }))
        } else {
            anyhow::bail!("one of -s or -v is required")
        }
    }
}

/// A failure that ends the process with `code`.
#[derive(Debug)]
struct Failure {
    code: u8,
    error: anyhow::Error,
}

trait ExitWith<T> {
    fn exit_with(self, code: u8) -> Result<T, Failure>;
}

impl<T, E: Into<anyhow::Error>> ExitWith<T> for Result<T, E> {
    fn exit_with(self, code: u8) -> Result<T, Failure> {
        self.map_err(|error| Failure {
            code,
            error: error.into(),
        })
    }
}

fn read_stdin_line() -> io::Result<Option<String>> {
    prompt::read_line(&mut io::stdin().lock())
}

fn read_stdin_letter() -> io::Result<Option<Vec<u8>>> {
    prompt::read_raw_line(&mut io::stdin().lock())
}

fn load_private_key(
    manager: &mut SignatureManager,
    path: &Path,
    password: Option<&str>,
    mut read_password: impl FnMut() -> io::Result<Option<String>>,
) -> anyhow::Result<()> {
    let first = match manager.load_private_key(path, password.unwrap_or("")) {
        Ok(()) => return Ok(()),
        Err(err @ SignatureError::Decrypt { .. }) => err,
        Err(err) => return Err(err.into()),
    };
    debug!("{first}; asking for the password");
    prompt::retry_password(
        &mut read_password,
        |password| manager.load_private_key(path, password),
        |err| matches!(err, SignatureError::Decrypt { .. }),
        first,
    )?
    .map_err(Into::into)
}

fn sign(options: SignOptions) -> Result<(), Failure> {
    let mut manager = SignatureManager::new();
    manager
        .load_certificate(&options.certificate)
        .exit_with(EXIT_LOAD)?;
    load_private_key(
        &mut manager,
        &options.key,
        options.password.as_deref(),
        || prompt::read_password("Enter password for private key: "),
    )
    .exit_with(EXIT_LOAD)?;
    if !manager.keys_match() {
        return Err(anyhow!(
            "the private key doesn't match the certificate: {}",
            manager.last_error()
        ))
        .exit_with(EXIT_LOAD);
    }

    let text = match options.text {
        Some(text) => text,
        None => read_stdin_line().exit_with(EXIT_LOAD)?.unwrap_or_default(),
    };
    let envelope =
        letter::sign(&options.fqrn, &text, options.algorithm, &manager).exit_with(EXIT_LOAD)?;
    println!("{envelope}");
    Ok(())
}

fn trust_material(options: &VerifyOptions) -> anyhow::Result<SignatureManager> {
    let mut manager = SignatureManager::new();
    if let Some(bundle) = &options.ca_bundle {
        manager
            .load_trusted_ca_crl(bundle)
            .with_context(|| format!("failed to load CA/CRLs from {bundle:?}"))?;
    }
    if !options.public_keys.is_empty() {
        match manager.load_trusted_public_keys(&options.public_keys) {
            Ok(()) => (),
            // The CA bundle alone is enough to go on with.
            Err(err) if options.ca_bundle.is_some() => warn!("ignoring public keys: {err}"),
            Err(err) => return Err(err).context("failed to load public keys"),
        }
    }
    Ok(manager)
}

fn verify(options: VerifyOptions) -> Result<(), Failure> {
    let manager = trust_material(&options).exit_with(EXIT_LOAD)?;
    let blacklist = Blacklist::load(&options.blacklist).exit_with(EXIT_LOAD)?;
    let fetcher = HttpFetcher::new(options.timeout).exit_with(EXIT_LOAD)?;
    let config = TrustConfig::new(options.fqrn, options.repository_url);
    let mut context = TrustContext::new(config, manager, blacklist, fetcher)
        .context("failed to load whitelist")
        .exit_with(EXIT_LOAD)?;

    let mut verify_one = |envelope: Vec<u8>| {
        let result = match String::from_utf8(envelope) {
            Ok(envelope) => context.verify(&envelope, options.max_age),
            Err(_) => Err(TrustFailure::from(LetterError::Malformed(
                "not valid UTF-8".to_string(),
            ))),
        };
        match result {
            Ok(letter) => (0, Some(letter.payload)),
            Err(failure) => {
                eprintln!("cvmfs-letter: {failure}");
                (failure.exit_code(), None)
            }
        }
    };

    if !options.repeat {
        let envelope = match options.text {
            Some(text) => text.into_bytes(),
            None => read_stdin_letter().exit_with(EXIT_LOAD)?.unwrap_or_default(),
        };
        return match verify_one(envelope) {
            (0, Some(payload)) => {
                println!("{payload}");
                Ok(())
            }
            (code, _) => Err(Failure {
                code,
                error: anyhow!("letter not accepted"),
            }),
        };
    }

    let mut last = 0;
    let mut pending = options.text.map(String::into_bytes);
    loop {
        let envelope = match pending.take() {
            Some(text) => text,
            None => match read_stdin_letter().exit_with(EXIT_LOAD)? {
                Some(line) => line,
                None => break,
            },
        };
        let (code, payload) = verify_one(envelope);
        println!("{code}");
        if let Some(payload) = payload {
            println!("{}", payload.len());
            println!("{payload}");
        }
        last = code;
    }

    match last {
        0 => Ok(()),
        code => Err(Failure {
            code,
            error: anyhow!("last letter not accepted"),
        }),
    }
}

fn main() -> ExitCode {
    env_logger::init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(EXIT_USAGE),
            };
        }
    };

    let result = match Mode::try_from(args) {
        Ok(Mode::Sign(options)) => sign(options),
        Ok(Mode::Verify(options)) => verify(options),
        Err(error) => Err(Failure {
            code: EXIT_USAGE,
            error,
        }),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(Failure { code, error }) => {
            debug!("exiting with {code}: {error:#}");
            if code <= EXIT_LOAD {
                eprintln!("cvmfs-letter: {error:#}");
            }
            ExitCode::from(code)
        }
    }
}
