use mctl_core::instance::in_managed_session;
use mctl_core::resolve::{PickOutcome, PickRequest, Picker, ResolveError};
use std::io::{self, Write};
use std::process::{Command, Stdio};
use tracing::debug;

/// fzf exits 1 on "no match" and 130 on interrupt; both mean the user backed out.
const EXIT_NO_MATCH: i32 = 1;
const EXIT_INTERRUPTED: i32 = 130;

/// Runs an fzf-compatible binary. Rows are fed on stdin prefixed with their
/// index, which is hidden from display and read back from the selection.
#[derive(Debug, Clone)]
pub struct FzfPicker {
    binary: String,
    popup: bool,
}

impl FzfPicker {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            popup: false,
        }
    }

    /// Inside the managed tmux session the picker opens as a popup.
    pub fn for_session(binary: impl Into<String>) -> Self {
        let popup = in_managed_session() && std::env::var_os("TMUX").is_some();
        Self {
            popup,
            ..Self::new(binary)
        }
    }

    fn args(&self, request: &PickRequest<'_>) -> Vec<String> {
        let mut args = vec![
            "--delimiter".to_string(),
            "\t".to_string(),
            "--with-nth".to_string(),
            "2..".to_string(),
            "--prompt".to_string(),
            request.prompt.to_string(),
            "--layout".to_string(),
            "reverse".to_string(),
        ];
        if let Some(query) = request.query {
            args.push("--query".to_string());
            args.push(query.to_string());
        }
        if request.multi {
            args.push("--multi".to_string());
        }
        if self.popup {
            args.push("--tmux".to_string());
            args.push("center,80%,60%".to_string());
        }
        args
    }
}

impl Picker for FzfPicker {
    fn pick(&self, request: &PickRequest<'_>) -> Result<PickOutcome, ResolveError> {
        let mut child = Command::new(&self.binary)
            .args(self.args(request))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => ResolveError::PickerMissing {
                    binary: self.binary.clone(),
                },
                _ => ResolveError::Picker(err.to_string()),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let input = indexed_input(request.rows);
            // fzf may exit before reading everything; a broken pipe is fine.
            if let Err(err) = stdin.write_all(input.as_bytes()) {
                if err.kind() != io::ErrorKind::BrokenPipe {
                    return Err(ResolveError::Picker(err.to_string()));
                }
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|err| ResolveError::Picker(err.to_string()))?;
        match output.status.code() {
            Some(0) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let picked = parse_selection(&stdout, request.rows.len());
                debug!(event = "picker_selected", count = picked.len());
                if picked.is_empty() {
                    Ok(PickOutcome::Cancelled)
                } else {
                    Ok(PickOutcome::Selected(picked))
                }
            }
            Some(EXIT_NO_MATCH) | Some(EXIT_INTERRUPTED) | None => Ok(PickOutcome::Cancelled),
            Some(code) => Err(ResolveError::Picker(format!(
                "{} exited with status {code}",
                self.binary
            ))),
        }
    }
}

fn indexed_input(rows: &[String]) -> String {
    let mut input = String::new();
    for (idx, row) in rows.iter().enumerate() {
        input.push_str(&format!("{idx}\t{row}\n"));
    }
    input
}

/// Indices from the picker's output, in selection order, bounded by `len`.
fn parse_selection(stdout: &str, len: usize) -> Vec<usize> {
    let mut picked = Vec::new();
    for line in stdout.lines() {
        let Some((idx, _)) = line.split_once('\t') else {
            continue;
        };
        if let Ok(idx) = idx.trim().parse::<usize>() {
            if idx < len && !picked.contains(&idx) {
                picked.push(idx);
            }
        }
    }
    picked
}
