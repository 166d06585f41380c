use rustc_hash::FxHashMap;
use thiserror::Error;

use super::{BlockId, InstKind, IrDb, ModId, Operand, Ty, TyId, ValueId, ValueKind};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line {line}: {msg}")]
    Syntax { line: usize, msg: String },
    #[error("line {line}: unknown name {name}")]
    UnknownName { line: usize, name: String },
    #[error("line {line}: duplicate name {name}")]
    Duplicate { line: usize, name: String },
}

pub fn parse(text: &str) -> Result<IrDb, ParseError> {
    let mut db = IrDb::new();
    let lines = lex(text)?;
    let mut module: Option<ModId> = None;
    let mut pos = 0;
    while pos < lines.len() {
        let (line, toks) = &lines[pos];
        let mut cur = Cursor::new(*line, toks);
        let head = cur.ident()?;
        match head.as_str() {
            "module" => {
                let name = cur.ident()?;
                cur.end()?;
                module = Some(db.add_module(&name));
                pos += 1;
            }
            "global" => {
                let module = module.ok_or_else(|| cur.err("no module declared"))?;
                parse_global(&mut db, module, &mut cur)?;
                pos += 1;
            }
            "declare" => {
                let module = module.ok_or_else(|| cur.err("no module declared"))?;
                parse_declare(&mut db, module, &mut cur)?;
                pos += 1;
            }
            "func" => {
                let module = module.ok_or_else(|| cur.err("no module declared"))?;
                pos = parse_func(&mut db, module, &lines, pos)?;
            }
            _ => return Err(cur.err(&format!("unexpected {}", head))),
        }
    }
    Ok(db)
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Global(String),
    Local(String),
    Ident(String),
    Int(i64),
    Punct(char),
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

fn lex(text: &str) -> Result<Vec<(usize, Vec<Tok>)>, ParseError> {
    let mut lines = vec![];
    for (i, raw) in text.lines().enumerate() {
        let line = i + 1;
        let mut toks = vec![];
        let mut chars = raw.chars().peekable();
        while let Some(&c) = chars.peek() {
            match c {
                ';' => break,
                c if c.is_whitespace() => {
                    chars.next();
                }
                '@' | '%' => {
                    chars.next();
                    let mut name = String::new();
                    while let Some(&c) = chars.peek() {
                        if !is_ident_char(c) {
                            break;
                        }
                        name.push(c);
                        chars.next();
                    }
                    if name.is_empty() {
                        return Err(ParseError::Syntax {
                            line,
                            msg: format!("empty name after {:?}", c),
                        });
                    }
                    toks.push(if c == '@' { Tok::Global(name) } else { Tok::Local(name) });
                }
                '(' | ')' | '{' | '}' | '[' | ']' | ',' | '=' | ':' | '*' => {
                    chars.next();
                    toks.push(Tok::Punct(c));
                }
                c if c.is_ascii_digit() || c == '-' => {
                    let mut s = String::new();
                    s.push(c);
                    chars.next();
                    while let Some(&c) = chars.peek() {
                        if !c.is_ascii_digit() {
                            break;
                        }
                        s.push(c);
                        chars.next();
                    }
                    let n = s.parse().map_err(|_| ParseError::Syntax {
                        line,
                        msg: format!("bad integer {}", s),
                    })?;
                    toks.push(Tok::Int(n));
                }
                c if is_ident_char(c) => {
                    let mut s = String::new();
                    while let Some(&c) = chars.peek() {
                        if !is_ident_char(c) {
                            break;
                        }
                        s.push(c);
                        chars.next();
                    }
                    toks.push(Tok::Ident(s));
                }
                c => {
                    return Err(ParseError::Syntax {
                        line,
                        msg: format!("unexpected character {:?}", c),
                    })
                }
            }
        }
        if !toks.is_empty() {
            lines.push((line, toks));
        }
    }
    Ok(lines)
}

struct Cursor<'a> {
    line: usize,
    toks: &'a [Tok],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(line: usize, toks: &'a [Tok]) -> Self {
        Self { line, toks, pos: 0 }
    }

    fn err(&self, msg: &str) -> ParseError {
        ParseError::Syntax {
            line: self.line,
            msg: msg.to_string(),
        }
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Result<Tok, ParseError> {
        let tok = self
            .toks
            .get(self.pos)
            .ok_or_else(|| self.err("unexpected end of line"))?;
        self.pos += 1;
        Ok(tok.clone())
    }

    fn ident(&mut self) -> Result<String, ParseError> {
        match self.next()? {
            Tok::Ident(s) => Ok(s),
            tok => Err(self.err(&format!("expected identifier, found {:?}", tok))),
        }
    }

    fn global(&mut self) -> Result<String, ParseError> {
        match self.next()? {
            Tok::Global(s) => Ok(s),
            tok => Err(self.err(&format!("expected @name, found {:?}", tok))),
        }
    }

    fn local(&mut self) -> Result<String, ParseError> {
        match self.next()? {
            Tok::Local(s) => Ok(s),
            tok => Err(self.err(&format!("expected %name, found {:?}", tok))),
        }
    }

    fn int(&mut self) -> Result<i64, ParseError> {
        match self.next()? {
            Tok::Int(n) => Ok(n),
            tok => Err(self.err(&format!("expected integer, found {:?}", tok))),
        }
    }

    fn punct(&mut self, c: char) -> Result<(), ParseError> {
        match self.next()? {
            Tok::Punct(p) if p == c => Ok(()),
            tok => Err(self.err(&format!("expected {:?}, found {:?}", c, tok))),
        }
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if self.peek() == Some(&Tok::Punct(c)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn at_end(&self) -> bool {
        self.pos == self.toks.len()
    }

    fn end(&mut self) -> Result<(), ParseError> {
        if self.at_end() {
            Ok(())
        } else {
            Err(self.err(&format!("trailing {:?}", self.toks[self.pos])))
        }
    }
}

fn parse_ty(db: &mut IrDb, cur: &mut Cursor<'_>) -> Result<TyId, ParseError> {
    let base = match cur.next()? {
        Tok::Ident(s) => match s.as_str() {
            "void" => Ty::Void,
            "opaque" => Ty::Opaque,
            _ => {
                let (head, rest) = s.split_at(1);
                let bits = rest
                    .parse()
                    .ok()
                    .filter(|_| head == "i" || head == "f")
                    .ok_or_else(|| cur.err(&format!("unknown type {}", s)))?;
                if head == "i" {
                    Ty::Int(bits)
                } else {
                    Ty::Float(bits)
                }
            }
        },
        Tok::Punct('[') => {
            let n = cur.int()?;
            if n < 0 {
                return Err(cur.err("negative array length"));
            }
            let x = cur.ident()?;
            if x != "x" {
                return Err(cur.err(&format!("expected x, found {}", x)));
            }
            let el = parse_ty(db, cur)?;
            cur.punct(']')?;
            Ty::Array(el, n as u64)
        }
        Tok::Punct('{') => {
            let mut fields = vec![];
            if !cur.eat_punct('}') {
                loop {
                    fields.push(parse_ty(db, cur)?);
                    if cur.eat_punct('}') {
                        break;
                    }
                    cur.punct(',')?;
                }
            }
            Ty::Struct(fields)
        }
        tok => return Err(cur.err(&format!("expected type, found {:?}", tok))),
    };
    let mut id = db.intern_ty(base);
    while cur.eat_punct('*') {
        id = db.ptr_to(id);
    }
    Ok(id)
}

fn parse_operand(
    db: &mut IrDb,
    cur: &mut Cursor<'_>,
    locals: &FxHashMap<String, ValueId>,
) -> Result<Operand, ParseError> {
    match cur.next()? {
        Tok::Local(name) => {
            let v = locals.get(&name).ok_or(ParseError::UnknownName {
                line: cur.line,
                name: format!("%{}", name),
            })?;
            Ok(Operand::Value(*v))
        }
        Tok::Global(name) => {
            let v = db.value_by_name(&name).ok_or(ParseError::UnknownName {
                line: cur.line,
                name: format!("@{}", name),
            })?;
            Ok(Operand::Value(v))
        }
        Tok::Int(n) => Ok(Operand::ConstInt(n)),
        Tok::Ident(s) if s == "null" => {
            cur.punct(':')?;
            let ty = parse_ty(db, cur)?;
            Ok(Operand::Null(ty))
        }
        Tok::Ident(s) if s == "bitcast" => {
            let name = cur.global()?;
            let v = db.value_by_name(&name).ok_or(ParseError::UnknownName {
                line: cur.line,
                name: format!("@{}", name),
            })?;
            let to = cur.ident()?;
            if to != "to" {
                return Err(cur.err(&format!("expected to, found {}", to)));
            }
            let ty = parse_ty(db, cur)?;
            if !db.is_global_object(v) {
                return Err(cur.err("bitcast expression requires a global object"));
            }
            if db.pointee(ty).is_none() {
                return Err(cur.err("bitcast expression requires a pointer type"));
            }
            Ok(Operand::Value(db.const_bitcast(v, ty)))
        }
        tok => Err(cur.err(&format!("expected operand, found {:?}", tok))),
    }
}

fn operand_ty(db: &IrDb, op: Operand) -> Option<TyId> {
    match op {
        Operand::Value(v) => Some(db.value_ty(v)),
        Operand::Null(t) => Some(t),
        Operand::ConstInt(_) => None,
    }
}

fn parse_global(db: &mut IrDb, module: ModId, cur: &mut Cursor<'_>) -> Result<(), ParseError> {
    let name = cur.global()?;
    if db.value_by_name(&name).is_some() {
        return Err(ParseError::Duplicate {
            line: cur.line,
            name: format!("@{}", name),
        });
    }
    cur.punct(':')?;
    let ty = parse_ty(db, cur)?;
    let init = if cur.eat_punct('=') {
        Some(parse_operand(db, cur, &FxHashMap::default())?)
    } else {
        None
    };
    cur.end()?;
    db.add_global(module, &name, ty, init);
    Ok(())
}

fn parse_declare(db: &mut IrDb, module: ModId, cur: &mut Cursor<'_>) -> Result<(), ParseError> {
    let name = cur.global()?;
    if db.value_by_name(&name).is_some() {
        return Err(ParseError::Duplicate {
            line: cur.line,
            name: format!("@{}", name),
        });
    }
    cur.punct('(')?;
    let mut params = vec![];
    if !cur.eat_punct(')') {
        loop {
            let ty = parse_ty(db, cur)?;
            params.push((params.len().to_string(), ty));
            if cur.eat_punct(')') {
                break;
            }
            cur.punct(',')?;
        }
    }
    let ret = if cur.eat_punct(':') {
        parse_ty(db, cur)?
    } else {
        db.intern_ty(Ty::Void)
    };
    cur.end()?;
    db.declare_function(module, &name, &params, ret);
    Ok(())
}

fn parse_func(
    db: &mut IrDb,
    module: ModId,
    lines: &[(usize, Vec<Tok>)],
    start: usize,
) -> Result<usize, ParseError> {
    let (line, toks) = &lines[start];
    let mut cur = Cursor::new(*line, toks);
    cur.ident()?; // func
    let name = cur.global()?;
    if db.value_by_name(&name).is_some() {
        return Err(ParseError::Duplicate {
            line: cur.line,
            name: format!("@{}", name),
        });
    }
    cur.punct('(')?;
    let mut params = vec![];
    if !cur.eat_punct(')') {
        loop {
            let pname = cur.local()?;
            cur.punct(':')?;
            let ty = parse_ty(db, &mut cur)?;
            params.push((pname, ty));
            if cur.eat_punct(')') {
                break;
            }
            cur.punct(',')?;
        }
    }
    let ret = if cur.eat_punct(':') {
        parse_ty(db, &mut cur)?
    } else {
        db.intern_ty(Ty::Void)
    };
    cur.punct('{')?;
    cur.end()?;

    let mut end = start + 1;
    while end < lines.len() && lines[end].1 != [Tok::Punct('}')] {
        end += 1;
    }
    if end == lines.len() {
        return Err(ParseError::Syntax {
            line: *line,
            msg: format!("unterminated body of @{}", name),
        });
    }

    let func = db.declare_function(module, &name, &params, ret);
    let mut locals = FxHashMap::default();
    let args = db.params(func).to_vec();
    for a in args {
        let pname = db.name(a).unwrap().to_string();
        if locals.insert(pname.clone(), a).is_some() {
            return Err(ParseError::Duplicate {
                line: *line,
                name: format!("%{}", pname),
            });
        }
    }

    let mut labels = FxHashMap::default();
    for (line, toks) in &lines[start + 1..end] {
        if let [Tok::Ident(label), Tok::Punct(':')] = toks.as_slice() {
            if labels.contains_key(label) {
                return Err(ParseError::Duplicate {
                    line: *line,
                    name: label.clone(),
                });
            }
            let b = db.add_block(func, label);
            labels.insert(label.clone(), b);
        }
    }

    let mut block = None;
    for (line, toks) in &lines[start + 1..end] {
        if let [Tok::Ident(label), Tok::Punct(':')] = toks.as_slice() {
            block = Some(labels[label]);
            continue;
        }
        let mut cur = Cursor::new(*line, toks);
        let block = block.ok_or_else(|| cur.err("expected block label"))?;
        parse_inst(db, func, block, &mut cur, &mut locals, &labels)?;
    }
    Ok(end + 1)
}

fn parse_label(cur: &mut Cursor<'_>, labels: &FxHashMap<String, BlockId>) -> Result<BlockId, ParseError> {
    let name = cur.ident()?;
    labels.get(&name).copied().ok_or(ParseError::UnknownName {
        line: cur.line,
        name,
    })
}

fn parse_inst(
    db: &mut IrDb,
    func: ValueId,
    block: BlockId,
    cur: &mut Cursor<'_>,
    locals: &mut FxHashMap<String, ValueId>,
    labels: &FxHashMap<String, BlockId>,
) -> Result<(), ParseError> {
    let name = if let Some(Tok::Local(_)) = cur.peek() {
        let n = cur.local()?;
        cur.punct('=')?;
        if locals.contains_key(&n) {
            return Err(ParseError::Duplicate {
                line: cur.line,
                name: format!("%{}", n),
            });
        }
        Some(n)
    } else {
        None
    };

    let void = db.intern_ty(Ty::Void);
    let op = cur.ident()?;
    let (ty, kind) = match op.as_str() {
        "alloca" => {
            let t = parse_ty(db, cur)?;
            (db.ptr_to(t), InstKind::Alloca(t))
        }
        "load" => {
            let p = parse_operand(db, cur, locals)?;
            let ty = operand_ty(db, p)
                .and_then(|t| db.pointee(t))
                .ok_or_else(|| cur.err("load from a non-pointer"))?;
            (ty, InstKind::Load(p))
        }
        "store" => {
            let val = parse_operand(db, cur, locals)?;
            cur.punct(',')?;
            let ptr = parse_operand(db, cur, locals)?;
            (void, InstKind::Store { val, ptr })
        }
        "call" => {
            let callee = parse_operand(db, cur, locals)?;
            cur.punct('(')?;
            let mut args = vec![];
            if !cur.eat_punct(')') {
                loop {
                    args.push(parse_operand(db, cur, locals)?);
                    if cur.eat_punct(')') {
                        break;
                    }
                    cur.punct(',')?;
                }
            }
            let ty = if cur.eat_punct(':') {
                parse_ty(db, cur)?
            } else if let Operand::Value(f) = callee {
                match db.value(f) {
                    ValueKind::Function { sig, .. } => {
                        let Ty::Func(_, ret) = db.ty(*sig) else { unreachable!() };
                        *ret
                    }
                    _ => void,
                }
            } else {
                void
            };
            (ty, InstKind::Call { callee, args })
        }
        "bitcast" => {
            let src = parse_operand(db, cur, locals)?;
            let to = cur.ident()?;
            if to != "to" {
                return Err(cur.err(&format!("expected to, found {}", to)));
            }
            let ty = parse_ty(db, cur)?;
            (ty, InstKind::Bitcast(src))
        }
        "gep" => {
            let base = parse_operand(db, cur, locals)?;
            let mut indices = vec![];
            while cur.eat_punct(',') {
                let n = cur.int()?;
                if n < 0 {
                    return Err(cur.err("negative gep index"));
                }
                indices.push(n as u64);
            }
            if indices.is_empty() {
                return Err(cur.err("gep without indices"));
            }
            let base_ty = operand_ty(db, base).ok_or_else(|| cur.err("bad gep base"))?;
            let ty = db
                .gep_result_ty(base_ty, &indices)
                .ok_or_else(|| cur.err("gep does not match the base type"))?;
            (ty, InstKind::Gep { base, indices })
        }
        "phi" => {
            let mut incomings = vec![];
            loop {
                cur.punct('[')?;
                let op = parse_operand(db, cur, locals)?;
                cur.punct(',')?;
                let b = parse_label(cur, labels)?;
                cur.punct(']')?;
                incomings.push((op, b));
                if !cur.eat_punct(',') {
                    break;
                }
            }
            let ty = incomings
                .iter()
                .find_map(|&(op, _)| operand_ty(db, op))
                .ok_or_else(|| cur.err("cannot infer the phi type"))?;
            (ty, InstKind::Phi(incomings))
        }
        "select" => {
            let cond = parse_operand(db, cur, locals)?;
            cur.punct(',')?;
            let then = parse_operand(db, cur, locals)?;
            cur.punct(',')?;
            let els = parse_operand(db, cur, locals)?;
            let ty = operand_ty(db, then)
                .or_else(|| operand_ty(db, els))
                .ok_or_else(|| cur.err("cannot infer the select type"))?;
            (ty, InstKind::Select { cond, then, els })
        }
        "br" => {
            let b = parse_label(cur, labels)?;
            (void, InstKind::Br(b))
        }
        "condbr" => {
            let cond = parse_operand(db, cur, locals)?;
            cur.punct(',')?;
            let then = parse_label(cur, labels)?;
            cur.punct(',')?;
            let els = parse_label(cur, labels)?;
            (void, InstKind::CondBr { cond, then, els })
        }
        "ret" => {
            let op = if cur.at_end() {
                None
            } else {
                Some(parse_operand(db, cur, locals)?)
            };
            (void, InstKind::Ret(op))
        }
        _ => return Err(cur.err(&format!("unknown instruction {}", op))),
    };
    cur.end()?;
    if name.is_some() && ty == void {
        return Err(cur.err("instruction has no result"));
    }
    let v = db.add_inst(func, block, name.as_deref(), ty, kind);
    if let Some(n) = name {
        locals.insert(n, v);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    static CODE: &str = "
        module m
        global @g : i32*
        declare @malloc(i64) : i8*
        func @f(%x : i32*, %n : i64) {
        entry:
          %p = alloca i32
          %q = bitcast %p to i8*
          store %x, @g
          %m = call @malloc(%n)
          condbr %n, more, done
        more:
          %y = load @g
          br done
        done:
          ret
        }
    ";

    fn value_names(db: &IrDb) -> Vec<String> {
        let mut names = vec![];
        db.walk_values(|v| names.push(db.display_value(v)));
        names
    }

    #[test]
    fn test_parse() {
        let db = parse(CODE).unwrap();
        let f = db.value_by_name("f").unwrap();
        assert!(db.is_function(f));
        assert!(db.has_body(f));
        assert_eq!(db.params(f).len(), 2);
        assert_eq!(db.blocks(f).len(), 3);
        assert_eq!(db.insts(f).count(), 8);

        let malloc = db.value_by_name("malloc").unwrap();
        assert!(!db.has_body(malloc));

        let p = db.local(f, "p").unwrap();
        assert!(db.is_alloca(p));
        assert!(db.is_pointer(p));
        let m = db.local(f, "m").unwrap();
        assert_eq!(db.called_function(m), Some(malloc));
        assert!(db.is_pointer(m));
        let n = db.local(f, "n").unwrap();
        assert!(!db.is_pointer(n));
    }

    #[test]
    fn test_walk_order() {
        let db = parse(CODE).unwrap();
        assert_eq!(
            value_names(&db),
            [
                "@g = global i32*",
                "@malloc = func (i64) -> i8*",
                "@f = func (i32*, i64) -> void",
                "%x in @f",
                "%p = alloca i32 in @f",
                "%q = bitcast %p in @f",
                "store %x, @g in @f",
                "%m = call @malloc(%n) in @f",
                "condbr %n in @f",
                "%y = load @g in @f",
                "br in @f",
                "ret in @f",
            ]
        );
    }

    #[test]
    fn test_users() {
        let db = parse(CODE).unwrap();
        let f = db.value_by_name("f").unwrap();
        let g = db.value_by_name("g").unwrap();
        let store = db
            .insts(f)
            .find(|&i| db.is_store(i))
            .unwrap();
        let y = db.local(f, "y").unwrap();
        assert_eq!(db.users(g).to_vec(), vec![store, y]);
    }

    #[test]
    fn test_store_size() {
        let mut db = parse(CODE).unwrap();
        let i32_ty = db.intern_ty(Ty::Int(32));
        assert_eq!(db.store_size(i32_ty), Some(4));
        let p = db.ptr_to(i32_ty);
        assert_eq!(db.store_size(p), Some(8));
        let arr = db.intern_ty(Ty::Array(i32_ty, 10));
        assert_eq!(db.store_size(arr), Some(40));
        let st = db.intern_ty(Ty::Struct(vec![i32_ty, p]));
        assert_eq!(db.store_size(st), Some(12));
        let opaque = db.intern_ty(Ty::Opaque);
        assert_eq!(db.store_size(opaque), None);
        let g = db.value_by_name("g").unwrap();
        assert_eq!(db.store_size(db.value_ty(g)), Some(8));
    }

    #[test]
    fn test_const_bitcast_interned() {
        let text = "
            module m
            global @a : i64
            func @f(%p : i8**) {
            entry:
              store bitcast @a to i8*, %p
              store bitcast @a to i8*, %p
              ret
            }
        ";
        let db = parse(text).unwrap();
        let a = db.value_by_name("a").unwrap();
        let users = db.users(a);
        assert_eq!(users.len(), 1);
        let (rhs, _) = db.const_expr_as_bitcast(users[0]).unwrap();
        assert_eq!(rhs, a);
    }

    #[test]
    fn test_unknown_name() {
        let text = "
            module m
            func @f() {
            entry:
              %y = load %x
              ret
            }
        ";
        assert!(matches!(
            parse(text),
            Err(ParseError::UnknownName { .. })
        ));
    }

    #[test]
    fn test_duplicate() {
        let text = "
            module m
            global @g : i32
            global @g : i32
        ";
        assert!(matches!(parse(text), Err(ParseError::Duplicate { .. })));
    }

    #[test]
    fn test_no_module() {
        assert!(matches!(
            parse("global @g : i32"),
            Err(ParseError::Syntax { .. })
        ));
    }
}
