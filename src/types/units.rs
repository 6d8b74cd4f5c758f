//! Unit Conversion Utilities
//!
//! Helpers for lamport formatting in logs and CLI output.

/// Lamports per SOL
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Convert lamports to SOL string (e.g., "0.001000000")
pub fn lamports_to_sol_string(lamports: u64) -> String {
    format!(
        "{}.{:09}",
        lamports / LAMPORTS_PER_SOL,
        lamports % LAMPORTS_PER_SOL
    )
}

/// Convert lamports to human-readable string
/// e.g., 1000000 -> "1,000,000 lamports (0.001000000 SOL)"
pub fn lamports_to_display(lamports: u64) -> String {
    format!(
        "{} lamports ({} SOL)",
        format_with_commas(lamports),
        lamports_to_sol_string(lamports)
    )
}

/// Format number with thousands separators
fn format_with_commas(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    let chars: Vec<char> = s.chars().collect();

    for (i, c) in chars.iter().enumerate() {
        if i > 0 && (chars.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }

    result
}
