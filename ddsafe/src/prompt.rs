//! dialoguer prompts shared by the subcommands and the interactive menu.
use anyhow::{Result, anyhow};
use console::style;
use ddsafe_core::{ConfirmationSummary, Confirmer, Device, gate::is_affirmative};
use dialoguer::{Input, Select, theme::ColorfulTheme};
use std::io::{IsTerminal, stdin};
use std::path::PathBuf;

pub fn theme() -> ColorfulTheme {
    ColorfulTheme::default()
}

/// Presents an interactive menu for the operator to select a device.
pub fn select_device(devices: &[Device], prompt: &str) -> Result<Device> {
    if devices.is_empty() {
        return Err(anyhow!("No block devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();
    let selection = Select::with_theme(&theme())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

pub fn select<T: std::fmt::Display>(prompt: &str, items: &[T], default: usize) -> Result<usize> {
    Ok(Select::with_theme(&theme())
        .with_prompt(prompt)
        .items(items)
        .default(default)
        .interact()?)
}

pub fn image_path(prompt: &str) -> Result<PathBuf> {
    let path: String = Input::with_theme(&theme())
        .with_prompt(prompt)
        .validate_with(|input: &String| {
            if input.trim().is_empty() {
                Err("a path is required")
            } else {
                Ok(())
            }
        })
        .interact_text()?;
    Ok(PathBuf::from(path.trim()))
}

/// Reads a value that parses as `T`, re-asking until it does.
pub fn parsed<T>(prompt: &str, default: String) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let text: String = Input::with_theme(&theme())
        .with_prompt(prompt)
        .default(default)
        .validate_with(|input: &String| input.parse::<T>().map(|_| ()).map_err(|e| e.to_string()))
        .interact_text()?;
    text.parse::<T>().map_err(|e| anyhow!("{e}"))
}

/// Asks the operator to type the configured phrase.
///
/// Anything other than the exact phrase declines, as does a standard input
/// that is not a terminal: nobody is there to answer.
pub struct PhraseConfirmer {
    phrase: String,
}

impl PhraseConfirmer {
    pub fn new(phrase: impl Into<String>) -> Self {
        Self {
            phrase: phrase.into(),
        }
    }
}

impl Confirmer for PhraseConfirmer {
    fn confirm(&mut self, summary: &ConfirmationSummary) -> ddsafe_core::Result<bool> {
        println!();
        if summary.kind.is_destructive() {
            println!(
                "{} This will permanently overwrite {}.",
                style("WARNING:").red().bold(),
                style(&summary.destination).cyan()
            );
        }
        println!("{summary}");
        println!();

        if !stdin().is_terminal() {
            tracing::warn!("standard input is not a terminal, refusing to confirm");
            println!("No terminal to confirm on; nothing was done.");
            return Ok(false);
        }

        let answer: String = Input::with_theme(&theme())
            .with_prompt(format!("Type '{}' to proceed", self.phrase))
            .allow_empty(true)
            .interact_text()
            .map_err(|e| ddsafe_core::Error::Io(std::io::Error::other(e)))?;
        Ok(is_affirmative(&answer, &self.phrase))
    }
}
