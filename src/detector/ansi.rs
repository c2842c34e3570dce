/// Strip terminal escape sequences from raw process output.
///
/// Removes CSI (`ESC [` and bare `0x9B`), OSC (terminated by BEL or `ESC \`)
/// and two-byte escapes, and drops carriage returns. Invalid UTF-8 is
/// replaced rather than rejected.
pub fn strip_ansi(input: &[u8]) -> String {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;

    while i < input.len() {
        match input[i] {
            0x1B => {
                i += 1;
                let Some(&next) = input.get(i) else {
                    break;
                };
                match next {
                    b'[' => i = skip_csi(input, i + 1),
                    b']' => i = skip_osc(input, i + 1),
                    _ => i += 1,
                }
            }
            0x9B => i = skip_csi(input, i + 1),
            b'\r' => i += 1,
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }

    match String::from_utf8(out) {
        Ok(text) => text,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    }
}

fn skip_csi(input: &[u8], mut i: usize) -> usize {
    while i < input.len() && (0x20..=0x3F).contains(&input[i]) {
        i += 1;
    }
    if i < input.len() && (0x40..=0x7E).contains(&input[i]) {
        i += 1;
    }
    i
}

fn skip_osc(input: &[u8], mut i: usize) -> usize {
    while i < input.len() {
        if input[i] == 0x07 {
            return i + 1;
        }
        if input[i] == 0x1B && input.get(i + 1) == Some(&b'\\') {
            return i + 2;
        }
        i += 1;
    }
    i
}
