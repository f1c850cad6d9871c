
/// `start, start + 1, ...` truncated to u16.
fn sequence(start: usize, len: usize) -> Vec<u16> {
    (start..start + len).map(|v| v as u16).collect()
}
