use super::FeePolicy;
use std::collections::BTreeMap;
use std::io::{BufRead, Write};

/// Decides whether a proposed set of policies may be pushed to the node.
pub trait Confirm: Send + Sync {
    fn confirm(&self, proposed: &BTreeMap<String, FeePolicy>) -> anyhow::Result<bool>;
}

/// Asks the operator on the terminal.
pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, proposed: &BTreeMap<String, FeePolicy>) -> anyhow::Result<bool> {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        ask(&mut stdin.lock(), &mut stdout, proposed)
    }
}

/// Print the proposal and read yes/no answers until one is recognized.
/// End of input counts as "no".
pub fn ask<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    proposed: &BTreeMap<String, FeePolicy>,
) -> anyhow::Result<bool> {
    writeln!(output, "Proposed fee policies:")?;
    for (channel_point, policy) in proposed {
        writeln!(
            output,
            "  {}  base {} msat, rate {:.6}, cltv {}",
            channel_point, policy.base_fee_msat, policy.fee_rate, policy.cltv
        )?;
    }
    write!(
        output,
        "Do you want to set these fees on {} channels? Enter [yes/no]: ",
        proposed.len()
    )?;
    output.flush()?;

    let mut line = String::new();
    loop {
        line.clear();
        if input.read_line(&mut line)? == 0 {
            return Ok(false);
        }
        match line.trim().to_ascii_lowercase().as_str() {
            "yes" | "y" => return Ok(true),
            "no" | "n" => return Ok(false),
            _ => {
                write!(output, "Please answer yes or no: ")?;
                output.flush()?;
            }
        }
    }
}
