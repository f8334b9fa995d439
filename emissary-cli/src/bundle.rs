// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Files an Emissary Bundle places next to the executable, and the operator
//! prompts used when they are absent.

use std::{
  io::{BufRead, IsTerminal, Write},
  path::{Path, PathBuf},
};

pub const IDENTITY_DIR: &str = "put_certificates_and_key_from_drawbridge_here";
pub const CLIENT_CERT_FILE: &str = "emissary-mtls-tcp.crt";
pub const CLIENT_KEY_FILE: &str = "emissary-mtls-tcp.key";
pub const CA_CERT_FILE: &str = "ca.crt";
pub const BUNDLE_DIR: &str = "bundle";
pub const BUNDLE_FILE: &str = "drawbridge.txt";

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
  #[error("Emissary could not determine where it is installed: {0}")]
  ExeDir(#[source] std::io::Error),
  #[error("the folder {dir:?} is missing")]
  MissingIdentityDir { dir: PathBuf },
  #[error(
    "Emissary was unable to find {file:?} in {dir:?}. Please request an Emissary Bundle from your Drawbridge admin."
  )]
  MissingIdentityFile { file: &'static str, dir: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPaths {
  pub cert: PathBuf,
  pub key: PathBuf,
  pub ca: PathBuf,
}

/// Where the bundle's files live, relative to an install root
#[derive(Debug, Clone)]
pub struct InstallLayout {
  root: PathBuf,
}

impl InstallLayout {
  pub fn at(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  /// Rooted at the folder holding the running executable
  pub fn from_current_exe() -> Result<Self, SetupError> {
    let exe = std::env::current_exe().map_err(SetupError::ExeDir)?;
    let root = exe.parent().map(Path::to_path_buf).ok_or_else(|| {
      SetupError::ExeDir(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "executable path has no parent folder",
      ))
    })?;
    Ok(Self::at(root))
  }

  pub fn identity_dir(&self) -> PathBuf {
    self.root.join(IDENTITY_DIR)
  }

  pub fn bundle_path(&self) -> PathBuf {
    self.root.join(BUNDLE_DIR).join(BUNDLE_FILE)
  }

  /// Locates the identity files, failing on the first one missing
  pub fn identity_paths(&self) -> Result<IdentityPaths, SetupError> {
    let dir = self.identity_dir();
    if !dir.is_dir() {
      return Err(SetupError::MissingIdentityDir { dir });
    }
    let require = |file: &'static str| {
      let path = dir.join(file);
      if path.is_file() {
        Ok(path)
      } else {
        Err(SetupError::MissingIdentityFile {
          file,
          dir: dir.clone(),
        })
      }
    };
    Ok(IdentityPaths {
      cert: require(CLIENT_CERT_FILE)?,
      key: require(CLIENT_KEY_FILE)?,
      ca: require(CA_CERT_FILE)?,
    })
  }

  /// The bundled Drawbridge address, if the bundle provides a non-empty one
  pub fn read_bundle(&self) -> Option<String> {
    let path = self.bundle_path();
    match std::fs::read_to_string(&path) {
      Ok(contents) => {
        let address = contents.trim();
        if address.is_empty() {
          tracing::warn!(path = %path.display(), "Emissary Bundle address file is empty");
          None
        } else {
          Some(address.to_string())
        }
      }
      Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
      Err(error) => {
        tracing::warn!(path = %path.display(), %error, "Failed reading Emissary Bundle address file");
        None
      }
    }
  }
}

pub fn print_onboarding() {
  println!("\n* * * * * * * * * * * *");
  println!("  Welcome to Emissary!");
  println!("* * * * * * * * * * * *");
  println!("\nFIRST TIME SETUP INSTRUCTIONS:");
  println!(
    "If you're seeing this, you aren't using an Emissary Bundle, or its {} folder and files were deleted.",
    IDENTITY_DIR
  );
}

/// Asks the operator for the Drawbridge address, reading one line from `input`
pub fn prompt_gateway_address<R: BufRead, W: Write>(
  input: &mut R,
  output: &mut W,
) -> std::io::Result<String> {
  writeln!(
    output,
    "Please enter your Drawbridge server URL or IP (e.g drawbridge.mysite.com:{port} or 50.162.50.224:{port}):",
    port = emissary::config::DEFAULT_GATEWAY_PORT
  )?;
  writeln!(
    output,
    "Please note the default Drawbridge reverse proxy port is {}.",
    emissary::config::DEFAULT_GATEWAY_PORT
  )?;
  write!(output, "Drawbridge server URL or IP: ")?;
  output.flush()?;
  let mut line = String::new();
  if input.read_line(&mut line)? == 0 {
    return Err(std::io::Error::new(
      std::io::ErrorKind::UnexpectedEof,
      "no Drawbridge address was entered",
    ));
  }
  writeln!(output)?;
  Ok(line.trim().to_string())
}

/// Reports a failure that ends the process.
///
/// Interactive operators get to read the message before the window closes.
pub fn fatal(message: &str, error: Option<&anyhow::Error>) -> ! {
  match error {
    Some(error) => eprintln!("{}: {:#}", message, error),
    None => eprintln!("{}", message),
  }
  let stdin = std::io::stdin();
  if stdin.is_terminal() {
    eprintln!("Press Enter to exit.");
    let mut discard = String::new();
    let _ = stdin.lock().read_line(&mut discard);
  }
  std::process::exit(1)
}
