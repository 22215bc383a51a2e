//! interp.rs — the on-device byte-code engine behind LOAD/EXEC/RETR
//!
//! The protocol treats the interpreter as opaque: source text goes in
//! through the staging region, a status code comes back in `Options`, and
//! whatever it wrote is drained block-wise from the output region. The
//! trait mirrors that contract so tests can substitute their own engine.

/// Status code 0 is success; anything else is surfaced to the station as
/// an interpreter error.
pub trait Interpreter: Send {
    /// Evaluate one staged source text. Bytes pushed through `out` land in
    /// the node's output region at the current write pointer.
    fn eval(&mut self, source: &str, out: &mut dyn FnMut(&[u8])) -> i32;
}

/// The engine the simulator ships: a whitespace-tokenized RPN calculator
/// over 64-bit integers. Each value left on the stack is written to the
/// output region as an ASCII decimal line, which gives the station's
/// `retrieve` handler something meaningful to decode.
///
/// Status codes: 1 = unparsable token, 2 = stack underflow, 3 = division
/// by zero.
#[derive(Debug, Default)]
pub struct RpnInterpreter;

impl Interpreter for RpnInterpreter {
    fn eval(&mut self, source: &str, out: &mut dyn FnMut(&[u8])) -> i32 {
        let mut stack: Vec<i64> = Vec::new();
        for token in source.split_whitespace() {
            match token {
                "+" | "-" | "*" | "/" => {
                    let (b, a) = match (stack.pop(), stack.pop()) {
                        (Some(b), Some(a)) => (b, a),
                        _ => return 2,
                    };
                    let value = match token {
                        "+" => a.wrapping_add(b),
                        "-" => a.wrapping_sub(b),
                        "*" => a.wrapping_mul(b),
                        _ => {
                            if b == 0 {
                                return 3;
                            }
                            a.wrapping_div(b)
                        }
                    };
                    stack.push(value);
                }
                _ => match token.parse::<i64>() {
                    Ok(v) => stack.push(v),
                    Err(_) => return 1,
                },
            }
        }
        for value in stack {
            out(format!("{value}\n").as_bytes());
        }
        0
    }
}
