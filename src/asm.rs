//! Textual assembler
//!
//! Line-oriented source: one instruction per line, `#` starts a comment,
//! `.func NAME` ... `.end` defines a macro whose body is inlined at each
//! use site. Unknown mnemonics assemble to HALT; a length-2 instruction
//! missing its operand gets the literal 0.
//!
//! The assembler is a front-end collaborator of the VM: only the word
//! stream it produces matters to execution.

use std::collections::HashMap;

use crate::vm::opcode::{Op, Program, Word};
use crate::vm::value::Value;

#[derive(Debug, Default)]
pub struct Assembler {
    /// Macro bodies, kept across `assemble` calls so spawned programs can
    /// share definitions.
    macros: HashMap<String, Vec<String>>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an operand token: i64 if it looks like one, else a string
    /// literal.
    fn atom(token: &str) -> Value {
        match token.parse::<i64>() {
            Ok(n) => Value::Int(n),
            Err(_) => Value::Str(token.to_string()),
        }
    }

    pub fn assemble(&mut self, source: &str) -> Program {
        // First pass: strip blanks and comment lines, record macro bodies,
        // splice macro bodies in at use sites.
        let mut expanded: Vec<String> = Vec::new();
        let mut defining: Option<String> = None;

        for raw in source.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix(".func ") {
                let name = rest
                    .split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_uppercase();
                self.macros.insert(name.clone(), Vec::new());
                defining = Some(name);
                continue;
            }
            if line == ".end" {
                defining = None;
                continue;
            }

            if let Some(name) = &defining {
                self.macros.entry(name.clone()).or_default().push(line.to_string());
                continue;
            }

            let head = match line.split_whitespace().next() {
                Some(head) => head.to_uppercase(),
                None => continue,
            };
            match self.macros.get(&head) {
                Some(body) => expanded.extend(body.iter().cloned()),
                None => expanded.push(line.to_string()),
            }
        }

        // Second pass: encode. Trailing comments are stripped here so
        // macro bodies may carry them too.
        let mut program = Program::new();
        for line in &expanded {
            let code = line.split('#').next().unwrap_or_default().trim();
            let mut parts = code.split_whitespace();
            let Some(mnemonic) = parts.next() else {
                continue;
            };
            match Op::from_mnemonic(&mnemonic.to_uppercase()) {
                Some(op) => {
                    program.push(Word::Op(op));
                    if op.width() == 2 {
                        let operand = parts.next().map(Self::atom).unwrap_or(Value::Int(0));
                        program.push(Word::Lit(operand));
                    }
                }
                // Unknown mnemonics compile to HALT.
                None => program.push(Word::Op(Op::Halt)),
            }
        }
        program
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_encoding() {
        let mut asm = Assembler::new();
        let program = asm.assemble("PUSH 2\nPUSH 3\nADD\nPRINT\nHALT");
        assert_eq!(
            program,
            vec![
                Word::Op(Op::Push),
                Word::Lit(Value::Int(2)),
                Word::Op(Op::Push),
                Word::Lit(Value::Int(3)),
                Word::Op(Op::Add),
                Word::Op(Op::Print),
                Word::Op(Op::Halt),
            ]
        );
    }

    #[test]
    fn test_string_operands_and_comments() {
        let mut asm = Assembler::new();
        let program = asm.assemble(
            "# greeting\n\
             PUSH hello  # inline comment\n\
             STORE a\n",
        );
        assert_eq!(
            program,
            vec![
                Word::Op(Op::Push),
                Word::Lit(Value::from("hello")),
                Word::Op(Op::Store),
                Word::Lit(Value::from("a")),
            ]
        );
    }

    #[test]
    fn test_macro_expansion() {
        let mut asm = Assembler::new();
        let program = asm.assemble(
            ".func TWICE\n\
             ADD\n\
             ADD\n\
             .end\n\
             PUSH 1\n\
             twice\n\
             HALT\n",
        );
        assert_eq!(
            program,
            vec![
                Word::Op(Op::Push),
                Word::Lit(Value::Int(1)),
                Word::Op(Op::Add),
                Word::Op(Op::Add),
                Word::Op(Op::Halt),
            ]
        );
    }

    #[test]
    fn test_unknown_mnemonic_becomes_halt() {
        let mut asm = Assembler::new();
        let program = asm.assemble("BOGUS\nPUSH 1");
        assert_eq!(program[0], Word::Op(Op::Halt));
        // Assembly continues past the replacement.
        assert_eq!(program[1], Word::Op(Op::Push));
    }

    #[test]
    fn test_missing_operand_defaults_to_zero() {
        let mut asm = Assembler::new();
        let program = asm.assemble("PUSH");
        assert_eq!(program, vec![Word::Op(Op::Push), Word::Lit(Value::Int(0))]);
    }
}
