//! Evaluation of the two families of unwind descriptors carried by symbol
//! files: postfix-expression frame programs (`STACK WIN`) and CFI rule sets
//! (`STACK CFI`).
//!
//! # Postfix programs
//!
//! Programs are whitespace-separated tokens in Reverse Polish notation,
//! evaluated against a stack of values and a map of variables:
//!
//! * Integer literals are decimal (possibly negative) or `0x`-prefixed hex.
//! * `$name` and `.name` read or name a variable. `$` names architectural
//!   registers, `.` synthetic values such as `.cfa` and `.ra`. Names without
//!   a prefix resolve as registers when bound, which is how ARM-style
//!   register names appear.
//! * `+ - * /` and `@` (bitwise AND) pop two values and push the result;
//!   arithmetic wraps at the evaluator's word width, division by zero fails.
//! * `^` pops an address and pushes the word-sized value read from memory.
//! * `=` pops a value and a variable name and binds the variable.
//! * `.undef` deletes a variable when assigned to it, and fails the
//!   expression when used as a value.
//!
//! Anything else is an error, as is running out of stack, reading an unbound
//! variable, or a failed memory read.
//!
//! # CFI rule sets
//!
//! A rule set is a map of `REG: EXPR` pairs. `.cfa` is evaluated first (it
//! may not refer to itself), then every other rule is evaluated with `.cfa`
//! bound. `.cfa` and `.ra` must both produce values; losing any other
//! register only loses that register. Registers no rule mentions are passed
//! through from the callee unchanged, which is how compilers express
//! "unmodified across the call".

use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, trace};

use crate::sym_file::types::StackInfoCfi;
use crate::MemoryRegion;

/// Register or variable values, keyed by their spelled name
/// (`$ebp`, `.cfa`, `x11`).
pub type RegisterMap<W> = HashMap<String, W>;

/// Machine word abstraction so one evaluator covers 32- and 64-bit modules.
pub trait Word: Copy + Eq + std::fmt::Debug {
    const BITS: u32;
    fn from_u64(val: u64) -> Self;
    fn to_u64(self) -> u64;
}

impl Word for u32 {
    const BITS: u32 = 32;
    fn from_u64(val: u64) -> Self {
        val as u32
    }
    fn to_u64(self) -> u64 {
        self as u64
    }
}

impl Word for u64 {
    const BITS: u32 = 64;
    fn from_u64(val: u64) -> Self {
        val
    }
    fn to_u64(self) -> u64 {
        self
    }
}

/// A value on the evaluation stack: a computed integer, a variable name
/// that hasn't been resolved yet, or the explicit unknown.
#[derive(Clone, Copy, Debug)]
enum Value<'a, W> {
    Int(W),
    Var(&'a str),
    Undef,
}

impl<'a, W: Word> Value<'a, W> {
    fn into_int(self, variables: &RegisterMap<W>) -> Option<W> {
        match self {
            Value::Int(val) => Some(val),
            Value::Var(name) => variables.get(name).copied(),
            Value::Undef => None,
        }
    }

    fn into_var(self) -> Option<&'a str> {
        match self {
            Value::Var(name) => Some(name),
            _ => None,
        }
    }
}

fn parse_literal<W: Word>(token: &str) -> Option<W> {
    if let Some(hex) = token.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok().map(W::from_u64)
    } else {
        i64::from_str(token).ok().map(|v| W::from_u64(v as u64))
    }
}

/// Evaluates postfix programs against a variable map and a memory oracle.
pub struct PostfixEvaluator<'a, W: Word> {
    variables: &'a mut RegisterMap<W>,
    memory: Option<&'a dyn MemoryRegion>,
}

impl<'a, W: Word> PostfixEvaluator<'a, W> {
    pub fn new(
        variables: &'a mut RegisterMap<W>,
        memory: Option<&'a dyn MemoryRegion>,
    ) -> PostfixEvaluator<'a, W> {
        PostfixEvaluator { variables, memory }
    }

    /// Evaluate a whole program for its side effects on the variable map.
    ///
    /// Values left on the stack afterwards are ignored; the output lives in
    /// the variables.
    pub fn evaluate(&mut self, program: &str) -> Option<()> {
        self.eval_tokens(program).map(|_| ())
    }

    /// Evaluate a single expression to its value.
    pub fn evaluate_for_value(&mut self, expr: &str) -> Option<W> {
        let mut stack = self.eval_tokens(expr)?;
        if stack.len() != 1 {
            debug!(
                "postfix expression didn't produce exactly one value: {}",
                expr
            );
            return None;
        }
        stack.pop()?.into_int(self.variables)
    }

    fn eval_tokens<'e>(&mut self, program: &'e str) -> Option<Vec<Value<'e, W>>> {
        let mut stack: Vec<Value<'e, W>> = Vec::new();
        for token in program.split_ascii_whitespace() {
            match token {
                "+" | "-" | "*" | "/" | "@" => {
                    let rhs = stack.pop()?.into_int(self.variables)?.to_u64();
                    let lhs = stack.pop()?.into_int(self.variables)?.to_u64();
                    let result = match token {
                        "+" => lhs.wrapping_add(rhs),
                        "-" => lhs.wrapping_sub(rhs),
                        "*" => lhs.wrapping_mul(rhs),
                        "/" => {
                            if rhs == 0 {
                                debug!("postfix evaluation failed - division by zero");
                                return None;
                            }
                            lhs.wrapping_div(rhs)
                        }
                        "@" => lhs & rhs,
                        _ => unreachable!(),
                    };
                    stack.push(Value::Int(W::from_u64(result)));
                }
                "^" => {
                    let ptr = stack.pop()?.into_int(self.variables)?;
                    let memory = self.memory?;
                    let val = memory.read(ptr.to_u64(), W::BITS)?;
                    stack.push(Value::Int(W::from_u64(val)));
                }
                "=" => {
                    let rhs = stack.pop()?;
                    let lhs = stack.pop()?.into_var()?;
                    if let Value::Undef = rhs {
                        self.variables.remove(lhs);
                    } else {
                        let val = rhs.into_int(self.variables)?;
                        self.variables.insert(lhs.to_string(), val);
                    }
                }
                ".undef" => stack.push(Value::Undef),
                _ => {
                    if let Some(val) = parse_literal::<W>(token) {
                        stack.push(Value::Int(val));
                    } else if token.starts_with('$') || token.starts_with('.') {
                        stack.push(Value::Var(token));
                    } else if let Some(&val) = self.variables.get(token) {
                        // ARM-style register names carry no prefix.
                        stack.push(Value::Int(val));
                    } else {
                        debug!("postfix evaluation failed - unknown token: {}", token);
                        return None;
                    }
                }
            }
        }
        Some(stack)
    }
}

/// The effective CFI rules at one instruction: the INIT rules with every
/// delta at or below the instruction folded in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CfiFrameInfo {
    rules: HashMap<String, String>,
}

impl CfiFrameInfo {
    /// Build the effective rule map for `address` (module-relative).
    ///
    /// Returns `None` if any rule string is malformed or the result lacks
    /// rules for `.cfa` and `.ra`.
    pub fn from_stack_info(info: &StackInfoCfi, address: u64) -> Option<CfiFrameInfo> {
        let mut rules = HashMap::new();
        parse_cfi_rules(&info.init.rules, &mut rules)?;
        for delta in &info.add_rules {
            if delta.address > address {
                break;
            }
            parse_cfi_rules(&delta.rules, &mut rules)?;
        }
        if !rules.contains_key(".cfa") || !rules.contains_key(".ra") {
            debug!("CFI rules are missing .cfa or .ra");
            return None;
        }
        Some(CfiFrameInfo { rules })
    }

    /// The expression for `register`, if any rule covers it.
    pub fn rule(&self, register: &str) -> Option<&str> {
        self.rules.get(register).map(String::as_str)
    }

    /// Compute the caller's registers from the callee's registers and the
    /// stack memory.
    ///
    /// Requires `.cfa` and `.ra` to evaluate; a general-purpose register
    /// whose rule fails is simply absent from the output. Registers no rule
    /// mentions are copied through unchanged.
    pub fn find_caller_registers<W: Word>(
        &self,
        registers: &RegisterMap<W>,
        memory: &dyn MemoryRegion,
    ) -> Option<RegisterMap<W>> {
        let cfa_expr = self.rules.get(".cfa")?;
        let ra_expr = self.rules.get(".ra")?;
        trace!("evaluating .cfa: {}", cfa_expr);

        // .cfa isn't bound while its own rule runs, so a self-reference
        // fails the evaluation.
        let mut working = registers.clone();
        let cfa = PostfixEvaluator::new(&mut working, Some(memory)).evaluate_for_value(cfa_expr)?;
        working.insert(".cfa".to_string(), cfa);
        let ra = PostfixEvaluator::new(&mut working, Some(memory)).evaluate_for_value(ra_expr)?;
        trace!("cfa={:?} ra={:?}", cfa, ra);

        let mut callers = registers.clone();
        callers.insert(".cfa".to_string(), cfa);
        callers.insert(".ra".to_string(), ra);
        for (register, expr) in &self.rules {
            if register == ".cfa" || register == ".ra" {
                continue;
            }
            match PostfixEvaluator::new(&mut working, Some(memory)).evaluate_for_value(expr) {
                Some(val) => {
                    callers.insert(register.clone(), val);
                }
                None => {
                    // Losing one general-purpose register is survivable,
                    // but don't forward the callee's value either.
                    callers.remove(register);
                }
            }
        }
        Some(callers)
    }
}

/// Split `REG: EXPR REG: EXPR ...` into the output map. Later rules for the
/// same register overwrite earlier ones.
fn parse_cfi_rules(input: &str, output: &mut HashMap<String, String>) -> Option<()> {
    let mut cur_reg: Option<&str> = None;
    let mut expr = String::new();
    for token in input.split_ascii_whitespace() {
        if let Some(reg) = token.strip_suffix(':') {
            if let Some(prev) = cur_reg.take() {
                if expr.is_empty() {
                    return None;
                }
                output.insert(prev.to_string(), std::mem::take(&mut expr));
            }
            cur_reg = Some(reg);
        } else {
            // The first token must name a register.
            cur_reg.as_ref()?;
            if !expr.is_empty() {
                expr.push(' ');
            }
            expr.push_str(token);
        }
    }
    let reg = cur_reg?;
    if expr.is_empty() {
        return None;
    }
    output.insert(reg.to_string(), expr);
    Some(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sym_file::types::CfiRules;

    /// Memory backed by a byte vector starting at address 0.
    struct TestMemory {
        bytes: Vec<u8>,
    }

    impl MemoryRegion for TestMemory {
        fn base_address(&self) -> u64 {
            0
        }
        fn size(&self) -> u64 {
            self.bytes.len() as u64
        }
        fn read(&self, address: u64, bits: u32) -> Option<u64> {
            let start = address as usize;
            let len = (bits / 8) as usize;
            let slice = self.bytes.get(start..start + len)?;
            let mut buf = [0u8; 8];
            buf[..len].copy_from_slice(slice);
            Some(u64::from_le_bytes(buf))
        }
    }

    fn regs32(pairs: &[(&str, u32)]) -> RegisterMap<u32> {
        pairs
            .iter()
            .map(|&(name, val)| (name.to_string(), val))
            .collect()
    }

    fn regs64(pairs: &[(&str, u64)]) -> RegisterMap<u64> {
        pairs
            .iter()
            .map(|&(name, val)| (name.to_string(), val))
            .collect()
    }

    fn build_cfi(init: &str, additional: &[&str]) -> StackInfoCfi {
        StackInfoCfi {
            init: CfiRules {
                address: 0,
                rules: init.to_string(),
            },
            size: 0x1000,
            add_rules: additional
                .iter()
                .enumerate()
                .map(|(idx, rules)| CfiRules {
                    address: idx as u64 + 1,
                    rules: rules.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_evaluate_doc_example() {
        // The standard prologue program: recover eip, esp and ebp.
        let expr = "$T0 $ebp = $eip $T0 4 + ^ = $ebp $T0 ^ = $esp $T0 8 + =";
        let mut stack = vec![0; 1600];

        const FINAL_EBP: u32 = 0xFA1E_F2E6;
        const FINAL_EIP: u32 = 0xB3EF_04CE;
        stack[16..20].copy_from_slice(&FINAL_EBP.to_le_bytes());
        stack[20..24].copy_from_slice(&FINAL_EIP.to_le_bytes());
        let memory = TestMemory { bytes: stack };

        let mut vars = regs32(&[("$ebp", 16), ("$esp", 1600)]);
        PostfixEvaluator::new(&mut vars, Some(&memory))
            .evaluate(expr)
            .unwrap();

        assert_eq!(vars["$esp"], 24);
        assert_eq!(vars["$ebp"], FINAL_EBP);
        assert_eq!(vars["$eip"], FINAL_EIP);
        assert_eq!(vars["$T0"], 16);
    }

    #[test]
    fn test_evaluate_ops() {
        let memory = TestMemory { bytes: vec![0; 64] };
        let mut vars = regs32(&[]);
        let mut eval = |program: &str, vars: &mut RegisterMap<u32>| {
            PostfixEvaluator::new(vars, Some(&memory)).evaluate(program)
        };

        // Addition, with wraparound on negatives.
        vars.clear();
        eval("$a 1 2 + = $b -4 0 + =", &mut vars).unwrap();
        assert_eq!(vars["$a"], 3);
        assert_eq!(vars["$b"], -4i32 as u32);

        // Subtraction.
        vars.clear();
        eval("$a 5 3 - = $b -4 2 - =", &mut vars).unwrap();
        assert_eq!(vars["$a"], 2);
        assert_eq!(vars["$b"], -6i32 as u32);

        // Multiplication.
        vars.clear();
        eval("$a 5 3 * = $b -4 2 * =", &mut vars).unwrap();
        assert_eq!(vars["$a"], 15);
        assert_eq!(vars["$b"], -8i32 as u32);

        // Division truncates.
        vars.clear();
        eval("$a 5 3 / =", &mut vars).unwrap();
        assert_eq!(vars["$a"], 1);

        // Bitwise AND.
        vars.clear();
        eval("$a 0xff 0x0f @ = $b 161 8 @ =", &mut vars).unwrap();
        assert_eq!(vars["$a"], 0x0f);
        assert_eq!(vars["$b"], 0);

        // Hex literals.
        vars.clear();
        eval("$a 0x10 16 + =", &mut vars).unwrap();
        assert_eq!(vars["$a"], 32);

        // Missing operands.
        assert!(eval("1 +", &mut vars).is_none());
        assert!(eval("1 -", &mut vars).is_none());
        assert!(eval("1 *", &mut vars).is_none());
        assert!(eval("1 /", &mut vars).is_none());
        assert!(eval("1 @", &mut vars).is_none());
        assert!(eval("^", &mut vars).is_none());

        // Division by zero.
        assert!(eval("$a 1 0 / =", &mut vars).is_none());

        // The remainder operator isn't part of this language.
        assert!(eval("$a 5 3 % =", &mut vars).is_none());
    }

    #[test]
    fn test_evaluate_corners() {
        let memory = TestMemory { bytes: vec![0; 64] };

        // Empty program leaves the variables alone.
        let mut vars = regs32(&[("$esp", 32), ("$ebp", 1600)]);
        PostfixEvaluator::new(&mut vars, Some(&memory))
            .evaluate("")
            .unwrap();
        assert_eq!(vars.len(), 2);

        // Assigning .undef deletes.
        let mut vars = regs32(&[("$esp", 32), ("$ebp", 1600)]);
        PostfixEvaluator::new(&mut vars, Some(&memory))
            .evaluate("$esp .undef = $ebp .undef =")
            .unwrap();
        assert!(vars.is_empty());

        // Self-assignment is fine.
        let mut vars = regs32(&[("$esp", 32)]);
        PostfixEvaluator::new(&mut vars, Some(&memory))
            .evaluate("$esp $esp =")
            .unwrap();
        assert_eq!(vars["$esp"], 32);

        // Trailing garbage on the stack is tolerated.
        let mut vars = regs32(&[]);
        PostfixEvaluator::new(&mut vars, Some(&memory))
            .evaluate("$a 1 = $b 2 = 3 4 5 $a $zzz")
            .unwrap();
        assert_eq!(vars["$a"], 1);
        assert_eq!(vars["$b"], 2);

        // Variables can be pushed before they're assigned.
        let mut vars = regs32(&[]);
        PostfixEvaluator::new(&mut vars, Some(&memory))
            .evaluate("$a $T0 $T0 2 = = $b 3 =")
            .unwrap();
        assert_eq!(vars["$a"], 2);
        assert_eq!(vars["$b"], 3);
    }

    #[test]
    fn test_evaluate_errors() {
        let memory = TestMemory { bytes: vec![0; 64] };
        let mut vars = regs32(&[("$esp", 32), ("$ebp", 1600)]);
        let mut eval = |program: &str, vars: &mut RegisterMap<u32>| {
            PostfixEvaluator::new(vars, Some(&memory)).evaluate(program)
        };

        // Reading past the end of memory.
        assert!(eval("$a 2000 ^ =", &mut vars).is_none());

        // Reading an unbound variable.
        assert!(eval("$a $kitties =", &mut vars).is_none());

        // Reading a deleted variable.
        let mut vars2 = regs32(&[("$esp", 32), ("$ebp", 0)]);
        assert!(eval("$esp .undef = $ebp $esp =", &mut vars2).is_none());

        // Assigning to an integer.
        assert!(eval("0 2 =", &mut vars).is_none());
        assert!(eval("0 $esp =", &mut vars).is_none());

        // Unprefixed, unbound names are unknown tokens.
        assert!(eval("esp 2 =", &mut vars).is_none());
    }

    #[test]
    fn test_evaluate_for_value() {
        let memory = TestMemory { bytes: vec![0; 64] };
        let mut vars = regs64(&[("$rsp", 32)]);
        let mut eval = PostfixEvaluator::new(&mut vars, Some(&memory));
        assert_eq!(eval.evaluate_for_value("$rsp 8 +"), Some(40));
        // Too many values left.
        assert_eq!(eval.evaluate_for_value("8 12"), None);
        // No value at all.
        assert_eq!(eval.evaluate_for_value(""), None);
        // .undef as a result is unknown.
        assert_eq!(eval.evaluate_for_value(".undef"), None);
    }

    #[test]
    fn test_cfi_doc_example() {
        // cfa = rsp + 24; ra = *(cfa - 8); rax = *(cfa - 16)
        let init = ".cfa: $rsp 8 + .ra: .cfa -8 + ^";
        let additional = &[".cfa: $rsp 16 + $rax: .cfa -16 + ^", ".cfa: $rsp 24 +"];

        const FINAL_CFA: usize = 32 + 24;
        const FINAL_RA: u64 = 0xFA1E_F2E6_A2DF_2B68;
        const FINAL_RAX: u64 = 0xB3EF_04CE_4321_FE2A;
        let mut stack = vec![0; 1600];
        stack[FINAL_CFA - 8..FINAL_CFA].copy_from_slice(&FINAL_RA.to_le_bytes());
        stack[FINAL_CFA - 16..FINAL_CFA - 8].copy_from_slice(&FINAL_RAX.to_le_bytes());
        let memory = TestMemory { bytes: stack };

        let registers = regs64(&[("$rsp", 32)]);
        let info = build_cfi(init, additional);
        let frame_info = CfiFrameInfo::from_stack_info(&info, 2).unwrap();
        let callers = frame_info
            .find_caller_registers(&registers, &memory)
            .unwrap();

        assert_eq!(callers[".cfa"], FINAL_CFA as u64);
        assert_eq!(callers[".ra"], FINAL_RA);
        assert_eq!(callers["$rax"], FINAL_RAX);
        // $rsp has no rule, so it passes through unchanged.
        assert_eq!(callers["$rsp"], 32);
    }

    #[test]
    fn test_cfi_delta_application() {
        // Only deltas at or below the instruction apply.
        let init = ".cfa: 8 .ra: 1";
        let additional = &[".cfa: 16", ".cfa: 24"];
        let info = build_cfi(init, additional);
        let memory = TestMemory { bytes: vec![] };
        let registers = regs64(&[]);

        let at0 = CfiFrameInfo::from_stack_info(&info, 0).unwrap();
        assert_eq!(
            at0.find_caller_registers(&registers, &memory).unwrap()[".cfa"],
            8
        );
        let at1 = CfiFrameInfo::from_stack_info(&info, 1).unwrap();
        assert_eq!(
            at1.find_caller_registers(&registers, &memory).unwrap()[".cfa"],
            16
        );
        let at2 = CfiFrameInfo::from_stack_info(&info, 0x500).unwrap();
        assert_eq!(
            at2.find_caller_registers(&registers, &memory).unwrap()[".cfa"],
            24
        );
    }

    #[test]
    fn test_cfi_errors() {
        let memory = TestMemory { bytes: vec![0; 64] };
        let registers = regs64(&[("$rsp", 32), ("$rip", 1600)]);
        let eval = |init: &str| {
            let info = build_cfi(init, &[]);
            CfiFrameInfo::from_stack_info(&info, 0)
                .and_then(|fi| fi.find_caller_registers(&registers, &memory))
        };

        // Missing .ra or .cfa.
        assert!(eval(".cfa: 8 16 +").is_none());
        assert!(eval(".ra: 8 16 *").is_none());

        // No rule separator at all.
        assert!(eval(".cfa 8 16 *").is_none());

        // Doesn't start with a register.
        assert!(eval("8 16 * .cfa: 16 .ra: 8").is_none());

        // .cfa leaves extra junk on the stack.
        assert!(eval(".cfa: 8 12 .ra: 8").is_none());

        // Empty expressions.
        assert!(eval(".cfa: 12 .ra: 8 $rax:").is_none());
        assert!(eval(".cfa: 12 .ra: 8 $rax: $rbx: 8").is_none());

        // .cfa and .ra may not be undefined.
        assert!(eval(".cfa: .undef .ra: 8").is_none());
        assert!(eval(".cfa: 8 .ra: .undef").is_none());

        // Deref out of bounds.
        assert!(eval(".cfa: 2000 ^ .ra: 8").is_none());

        // Unknown or unbound registers in required rules.
        assert!(eval(".cfa: 8 .ra: $kitties").is_none());
        assert!(eval(".cfa: 8 .ra: $rax").is_none());

        // .cfa may not be computed from itself, and .ra is never readable.
        assert!(eval(".cfa: .cfa .ra: 2").is_none());
        assert!(eval(".cfa: .ra .ra: 2").is_none());
        assert!(eval(".cfa: 1 .ra: .ra").is_none());
    }

    #[test]
    fn test_cfi_corners() {
        let memory = TestMemory { bytes: vec![0; 64] };
        let registers = regs64(&[("$rsp", 32), ("$rip", 1600)]);
        let eval = |init: &str| {
            let info = build_cfi(init, &[]);
            CfiFrameInfo::from_stack_info(&info, 0)
                .and_then(|fi| fi.find_caller_registers(&registers, &memory))
        };

        // Plain values for each register.
        let callers = eval(".cfa: 8 .ra: 12 $rax: 16").unwrap();
        assert_eq!(callers[".cfa"], 8);
        assert_eq!(callers[".ra"], 12);
        assert_eq!(callers["$rax"], 16);

        // A failing general-purpose rule drops only that register.
        let callers = eval(".cfa: 1 .ra: 8 $rax: 1 0 /").unwrap();
        assert_eq!(callers[".cfa"], 1);
        assert_eq!(callers[".ra"], 8);
        assert!(!callers.contains_key("$rax"));

        // An undefined register rule drops the register, and a failing rule
        // also suppresses the callee's value.
        let callers = eval(".cfa: 8 .ra: 12 $rip: .undef").unwrap();
        assert!(!callers.contains_key("$rip"));

        // Duplicate rules: the later one wins.
        let callers = eval(".cfa: 1 .cfa: 2 .ra: 3 .ra: 4 $rax: 5 $rax: 6").unwrap();
        assert_eq!(callers[".cfa"], 2);
        assert_eq!(callers[".ra"], 4);
        assert_eq!(callers["$rax"], 6);

        // Rules may use the computed .cfa.
        let callers = eval(".cfa: 7 .ra: .cfa 1 + $rax: .cfa 2 -").unwrap();
        assert_eq!(callers[".cfa"], 7);
        assert_eq!(callers[".ra"], 8);
        assert_eq!(callers["$rax"], 5);

        // Unmentioned registers pass through.
        let callers = eval(".cfa: 8 .ra: 12").unwrap();
        assert_eq!(callers["$rsp"], 32);
        assert_eq!(callers["$rip"], 1600);
    }

    #[test]
    fn test_cfi_arm_registers() {
        // ARM register names carry no prefix in either position.
        let memory = TestMemory { bytes: vec![] };
        let registers = regs64(&[("pc", 32), ("x11", 1600)]);
        let info = build_cfi(".cfa: 8 .ra: 12 x11: 16 x12: x11 .cfa +", &[]);
        let callers = CfiFrameInfo::from_stack_info(&info, 0)
            .unwrap()
            .find_caller_registers(&registers, &memory)
            .unwrap();
        assert_eq!(callers[".cfa"], 8);
        assert_eq!(callers[".ra"], 12);
        assert_eq!(callers["x11"], 16);
        assert_eq!(callers["x12"], 1608);
    }

    #[test]
    fn test_cfi_32bit_recovery() {
        // A 32-bit prologue that pushes %ebp, then %ebx, %esi and %edi.
        // Whatever instruction evaluation happens at, the recovered caller
        // registers are the same.
        let info = build_cfi(
            ".cfa: $esp 4 + .ra: .cfa 4 - ^",
            &[
                ".cfa: $esp 8 + $ebp: .cfa 8 - ^",
                ".cfa: $ebp 8 +",
                "$ebx: .cfa 20 - ^",
                "$esi: .cfa 16 - ^",
                "$edi: .cfa 12 - ^",
            ],
        );
        let mut stack = vec![0u8; 0x20];
        stack[0x08..0x0c].copy_from_slice(&0x98ec_adc3u32.to_le_bytes()); // saved %ebx
        stack[0x0c..0x10].copy_from_slice(&0x878f_7524u32.to_le_bytes()); // saved %esi
        stack[0x10..0x14].copy_from_slice(&0x6312_f9a5u32.to_le_bytes()); // saved %edi
        stack[0x14..0x18].copy_from_slice(&0x38u32.to_le_bytes()); // caller's %ebp
        stack[0x18..0x1c].copy_from_slice(&0xf643_8648u32.to_le_bytes()); // return address
        let memory = TestMemory { bytes: stack };

        let mut registers = regs32(&[
            ("$esp", 0x18),
            ("$ebp", 0x38),
            ("$ebx", 0x98ec_adc3),
            ("$esi", 0x878f_7524),
            ("$edi", 0x6312_f9a5),
        ]);
        // How the callee's registers look as the prologue executes.
        let stages: &[&[(&str, u32)]] = &[
            &[],
            &[("$esp", 0x14)],
            &[("$ebp", 0x14)],
            &[("$ebx", 0x6864_f054)],
            &[("$esi", 0x6285_f79a)],
            &[("$edi", 0x6406_1449)],
        ];
        for (pc, updates) in stages.iter().enumerate() {
            for &(name, val) in updates.iter() {
                registers.insert(name.to_string(), val);
            }
            let callers = CfiFrameInfo::from_stack_info(&info, pc as u64)
                .unwrap()
                .find_caller_registers(&registers, &memory)
                .unwrap();
            assert_eq!(callers[".cfa"], 0x1c, "at stage {pc}");
            assert_eq!(callers[".ra"], 0xf643_8648, "at stage {pc}");
            assert_eq!(callers["$ebp"], 0x38, "at stage {pc}");
            assert_eq!(callers["$ebx"], 0x98ec_adc3, "at stage {pc}");
            assert_eq!(callers["$esi"], 0x878f_7524, "at stage {pc}");
            assert_eq!(callers["$edi"], 0x6312_f9a5, "at stage {pc}");
        }
    }

    #[test]
    fn test_unchanged_registers_roundtrip() {
        // Any register without a rule must come back bit-identical,
        // at any instruction in the range.
        let memory = TestMemory { bytes: vec![] };
        let info = build_cfi(".cfa: 16 .ra: 32", &[".cfa: 48"]);
        for pc in [0u64, 1, 2, 0x800] {
            let registers = regs64(&[("$r8", 0xdead_beef), ("$r9", pc ^ 0x5555)]);
            let callers = CfiFrameInfo::from_stack_info(&info, pc)
                .unwrap()
                .find_caller_registers(&registers, &memory)
                .unwrap();
            assert_eq!(callers["$r8"], registers["$r8"]);
            assert_eq!(callers["$r9"], registers["$r9"]);
        }
    }
}
