//! Rebuilds a command line so the current operation can be started again
//! as a service.

use anyhow::{bail, Context, Result};
use clap::parser::ValueSource;
use clap::{ArgMatches, Command};

/// A flag to add to a reconstructed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flag {
    pub name: String,
    pub value: String,
}

impl Flag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Re-parses `args` (without the binary name) against `command` and returns
/// them with every value quoted, followed by each of `flags` the original
/// line did not already set. Boolean flags are emitted without a value.
pub fn update_command_with_flags(
    command: &Command,
    args: &[String],
    flags: &[Flag],
) -> Result<Vec<String>> {
    let matches = command
        .clone()
        .no_binary_name(true)
        .try_get_matches_from(args)
        .context("Failed to parse the original command line")?;

    let mut path = Vec::new();
    let mut levels = vec![(command, &matches)];
    let (mut cmd, mut current) = (command, &matches);
    while let Some((name, sub_matches)) = current.subcommand() {
        let sub = cmd
            .find_subcommand(name)
            .with_context(|| format!("unknown subcommand {}", name))?;
        path.push(name.to_string());
        levels.push((sub, sub_matches));
        cmd = sub;
        current = sub_matches;
    }

    let mut line = path;
    for (cmd, matches) in &levels {
        line.extend(explicit_args(cmd, matches));
    }

    for flag in flags {
        let arg = levels
            .iter()
            .rev()
            .find_map(|(cmd, matches)| {
                cmd.get_arguments()
                    .find(|arg| arg.get_long() == Some(flag.name.as_str()))
                    .map(|arg| (arg, *matches))
            });
        let Some((arg, matches)) = arg else {
            bail!("unknown flag --{}", flag.name);
        };
        if matches.value_source(arg.get_id().as_str()) == Some(ValueSource::CommandLine) {
            continue;
        }

        if arg.get_action().takes_values() {
            line.push(format!("--{}", flag.name));
            line.push(quote(&flag.value));
        } else if flag.value.parse::<bool>().unwrap_or(true) {
            line.push(format!("--{}", flag.name));
        }
    }

    Ok(line)
}

/// Arguments of one command level that were given on the command line, in
/// the order they appeared.
fn explicit_args(command: &Command, matches: &ArgMatches) -> Vec<String> {
    let mut entries: Vec<(usize, Vec<String>)> = Vec::new();
    for arg in command.get_arguments() {
        let id = arg.get_id().as_str();
        if matches.value_source(id) != Some(ValueSource::CommandLine) {
            continue;
        }
        let indices: Vec<usize> = matches
            .indices_of(id)
            .map(|indices| indices.collect())
            .unwrap_or_default();
        let index_of = |i: usize| indices.get(i).copied().unwrap_or(usize::MAX);
        let values: Vec<String> = matches
            .get_raw(id)
            .map(|raw| raw.map(|v| quote(&v.to_string_lossy())).collect())
            .unwrap_or_default();

        if arg.is_positional() {
            entries.extend(values.into_iter().enumerate().map(|(i, v)| (index_of(i), vec![v])));
            continue;
        }
        let name = match (arg.get_long(), arg.get_short()) {
            (Some(long), _) => format!("--{}", long),
            (None, Some(short)) => format!("-{}", short),
            (None, None) => continue,
        };
        if arg.get_action().takes_values() {
            entries.extend(
                values
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| (index_of(i), vec![name.clone(), v])),
            );
        } else {
            entries.push((index_of(0), vec![name]));
        }
    }

    entries.sort_by_key(|(index, _)| *index);
    entries.into_iter().flat_map(|(_, tokens)| tokens).collect()
}

fn quote(value: &str) -> String {
    format!("{:?}", value)
}
