// File: src/debug.rs
//
// Textual disassembler for `Chunk`s: `OFFSET LINE NAME [operand ...]`,
// stable enough to be snapshot-tested (spec §4.7).

use crate::chunk::{Chunk, OpCode};

pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = format!("== {} ==\n", name);
    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction_into(&mut out, chunk, offset);
    }
    out
}

pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut out = String::new();
    let next = disassemble_instruction_into(&mut out, chunk, offset);
    // Strip the trailing newline disassemble_instruction_into always adds.
    if out.ends_with('\n') {
        out.pop();
    }
    (out, next)
}

fn disassemble_instruction_into(out: &mut String, chunk: &Chunk, offset: usize) -> usize {
    out.push_str(&format!("{:04} ", offset));
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        out.push_str("   | ");
    } else {
        out.push_str(&format!("{:4} ", chunk.line_at(offset)));
    }

    let byte = chunk.read(offset);
    match OpCode::from_byte(byte) {
        Some(OpCode::Constant) => constant_instruction(out, "OP_CONSTANT", chunk, offset),
        Some(OpCode::Nil) => simple_instruction(out, "OP_NIL", offset),
        Some(OpCode::True) => simple_instruction(out, "OP_TRUE", offset),
        Some(OpCode::False) => simple_instruction(out, "OP_FALSE", offset),
        Some(OpCode::Pop) => simple_instruction(out, "OP_POP", offset),
        Some(OpCode::GetLocal) => byte_instruction(out, "OP_GET_LOCAL", chunk, offset),
        Some(OpCode::SetLocal) => byte_instruction(out, "OP_SET_LOCAL", chunk, offset),
        Some(OpCode::GetGlobal) => constant_instruction(out, "OP_GET_GLOBAL", chunk, offset),
        Some(OpCode::DefineGlobal) => constant_instruction(out, "OP_DEFINE_GLOBAL", chunk, offset),
        Some(OpCode::SetGlobal) => constant_instruction(out, "OP_SET_GLOBAL", chunk, offset),
        Some(OpCode::GetUpvalue) => byte_instruction(out, "OP_GET_UPVALUE", chunk, offset),
        Some(OpCode::SetUpvalue) => byte_instruction(out, "OP_SET_UPVALUE", chunk, offset),
        Some(OpCode::Equal) => simple_instruction(out, "OP_EQUAL", offset),
        Some(OpCode::Greater) => simple_instruction(out, "OP_GREATER", offset),
        Some(OpCode::Less) => simple_instruction(out, "OP_LESS", offset),
        Some(OpCode::Add) => simple_instruction(out, "OP_ADD", offset),
        Some(OpCode::Subtract) => simple_instruction(out, "OP_SUBTRACT", offset),
        Some(OpCode::Multiply) => simple_instruction(out, "OP_MULTIPLY", offset),
        Some(OpCode::Divide) => simple_instruction(out, "OP_DIVIDE", offset),
        Some(OpCode::Not) => simple_instruction(out, "OP_NOT", offset),
        Some(OpCode::Negate) => simple_instruction(out, "OP_NEGATE", offset),
        Some(OpCode::Print) => simple_instruction(out, "OP_PRINT", offset),
        Some(OpCode::Jump) => jump_instruction(out, "OP_JUMP", 1, chunk, offset),
        Some(OpCode::JumpIfFalse) => jump_instruction(out, "OP_JUMP_IF_FALSE", 1, chunk, offset),
        Some(OpCode::Loop) => jump_instruction(out, "OP_LOOP", -1, chunk, offset),
        Some(OpCode::Call) => byte_instruction(out, "OP_CALL", chunk, offset),
        Some(OpCode::Closure) => closure_instruction(out, chunk, offset),
        Some(OpCode::Return) => simple_instruction(out, "OP_RETURN", offset),
        None => {
            out.push_str(&format!("Unknown opcode {}\n", byte));
            offset + 1
        }
    }
}

fn simple_instruction(out: &mut String, name: &str, offset: usize) -> usize {
    out.push_str(name);
    out.push('\n');
    offset + 1
}

fn byte_instruction(out: &mut String, name: &str, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.read(offset + 1);
    out.push_str(&format!("{:<16} {:4}\n", name, slot));
    offset + 2
}

fn constant_instruction(out: &mut String, name: &str, chunk: &Chunk, offset: usize) -> usize {
    let idx = chunk.read(offset + 1) as usize;
    out.push_str(&format!("{:<16} {:4} '{}'\n", name, idx, chunk.constants[idx]));
    offset + 2
}

fn jump_instruction(out: &mut String, name: &str, sign: i32, chunk: &Chunk, offset: usize) -> usize {
    let jump = chunk.read_u16(offset + 1) as i32;
    let target = offset as i32 + 3 + sign * jump;
    out.push_str(&format!("{:<16} {:4} -> {}\n", name, offset, target));
    offset + 3
}

fn closure_instruction(out: &mut String, chunk: &Chunk, offset: usize) -> usize {
    let idx = chunk.read(offset + 1) as usize;
    out.push_str(&format!("{:<16} {:4} '{}'\n", "OP_CLOSURE", idx, chunk.constants[idx]));
    let mut next = offset + 2;
    let upvalue_count = match &chunk.constants[idx] {
        crate::value::Value::Obj(obj) => obj.as_function().map(|f| f.upvalue_count).unwrap_or(0),
        _ => 0,
    };
    for _ in 0..upvalue_count {
        let is_local = chunk.read(next);
        let index = chunk.read(next + 1);
        out.push_str(&format!(
            "{:04}      |                     {} {}\n",
            next,
            if is_local != 0 { "local" } else { "upvalue" },
            index
        ));
        next += 2;
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn disassembles_a_constant_and_return() {
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::Number(1.0));
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(idx as u8, 1);
        chunk.write_op(OpCode::Return, 1);
        let out = disassemble_chunk(&chunk, "test");
        assert!(out.contains("OP_CONSTANT"));
        assert!(out.contains("OP_RETURN"));
    }

    #[test]
    fn unknown_opcode_reports_and_advances_by_one() {
        let mut chunk = Chunk::new();
        chunk.write(0xee, 1);
        chunk.write_op(OpCode::Return, 1);
        let out = disassemble_chunk(&chunk, "test");
        assert!(out.contains("Unknown opcode 238"));
    }

    #[test]
    fn repeated_line_prints_pipe_instead_of_number() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Nil, 5);
        chunk.write_op(OpCode::Pop, 5);
        let out = disassemble_chunk(&chunk, "test");
        assert!(out.contains("   | "));
    }
}
