//! Reads the textual form of a [`Module`] (see [`crate::printer`]).
//!
//! The text is one item per line (`;` starts a comment); function bodies span the lines between
//! `define ... {` and `}`. Structs, globals and functions may be referred to before the line
//! defining them, and so may values and blocks within a function body.

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::ir::{
    BinOp, BlockId, CastOp, CmpPred, ConstExpr, FnAttr, FuncId, GlobalId, Initializer, InstId,
    InstKind, Module, ValueId,
};
use crate::types::{Type, TypeId};

#[derive(Clone, PartialEq, Eq, Debug)]
enum Tok {
    Word(String),
    Local(String),
    Global(String),
    Int(i128),
    Str(String),
    Punct(char),
    Arrow,
    Marker(String),
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '$'
}

fn tokenize(line: &str) -> Result<Vec<Tok>, String> {
    let chars: Vec<char> = line.chars().collect();
    let mut toks = vec![];
    let mut i = 0;
    let name = |i: &mut usize| {
        let start = *i;
        while *i < chars.len() && is_name_char(chars[*i]) {
            *i += 1;
        }
        chars[start..*i].iter().collect::<String>()
    };
    while i < chars.len() {
        let c = chars[i];
        match c {
            ';' => break,
            c if c.is_whitespace() => i += 1,
            '%' | '@' | '!' => {
                i += 1;
                let n = name(&mut i);
                if n.is_empty() {
                    return Err(format!("Expected a name after '{}'", c));
                }
                toks.push(match c {
                    '%' => Tok::Local(n),
                    '@' => Tok::Global(n),
                    _ => Tok::Marker(n),
                });
            }
            '"' => {
                i += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err("Unterminated string".into()),
                        Some('"') => break,
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some(&e) => s.push(e),
                                None => return Err("Unterminated string".into()),
                            }
                            i += 2;
                            continue;
                        }
                        Some(&c) => s.push(c),
                    }
                    i += 1;
                }
                i += 1;
                toks.push(Tok::Str(s));
            }
            '-' if chars.get(i + 1) == Some(&'>') => {
                i += 2;
                toks.push(Tok::Arrow);
            }
            '-' | '0'..='9' => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let s: String = chars[start..i].iter().collect();
                let n = s
                    .parse::<i128>()
                    .map_err(|_| format!("Bad integer literal {}", s))?;
                toks.push(Tok::Int(n));
            }
            '{' | '}' | '(' | ')' | '[' | ']' | '<' | '>' | ',' | ':' | '=' => {
                i += 1;
                toks.push(Tok::Punct(c));
            }
            c if is_name_char(c) => {
                let n = name(&mut i);
                toks.push(Tok::Word(n));
            }
            c => return Err(format!("Unexpected character {:?}", c)),
        }
    }
    Ok(toks)
}

/// A cursor over the tokens of one line
struct Cursor<'t> {
    toks: &'t [Tok],
    pos: usize,
}

impl<'t> Cursor<'t> {
    fn new(toks: &'t [Tok]) -> Self {
        Self { toks, pos: 0 }
    }

    fn peek(&self) -> Option<&'t Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Result<&'t Tok, String> {
        let t = self.toks.get(self.pos).ok_or("Unexpected end of line")?;
        self.pos += 1;
        Ok(t)
    }

    fn at_end(&self) -> bool {
        self.pos == self.toks.len()
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if self.peek() == Some(&Tok::Punct(c)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn punct(&mut self, c: char) -> Result<(), String> {
        if self.eat_punct(c) {
            Ok(())
        } else {
            Err(format!("Expected '{}', got {:?}", c, self.peek()))
        }
    }

    fn eat_word(&mut self, w: &str) -> bool {
        if matches!(self.peek(), Some(Tok::Word(x)) if x == w) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn word(&mut self) -> Result<&'t str, String> {
        match self.next()? {
            Tok::Word(w) => Ok(w),
            t => Err(format!("Expected a word, got {:?}", t)),
        }
    }

    fn local(&mut self) -> Result<&'t str, String> {
        match self.next()? {
            Tok::Local(w) => Ok(w),
            t => Err(format!("Expected a %name, got {:?}", t)),
        }
    }

    fn global(&mut self) -> Result<&'t str, String> {
        match self.next()? {
            Tok::Global(w) => Ok(w),
            t => Err(format!("Expected an @name, got {:?}", t)),
        }
    }

    fn string(&mut self) -> Result<&'t str, String> {
        match self.next()? {
            Tok::Str(s) => Ok(s),
            t => Err(format!("Expected a string, got {:?}", t)),
        }
    }

    fn int(&mut self) -> Result<i128, String> {
        match self.next()? {
            Tok::Int(n) => Ok(*n),
            t => Err(format!("Expected an integer, got {:?}", t)),
        }
    }

    fn end(&self) -> Result<(), String> {
        if self.at_end() {
            Ok(())
        } else {
            Err(format!("Trailing tokens starting at {:?}", self.peek()))
        }
    }
}

/// Two's complement bits of a literal
fn literal_bits(n: i128) -> Result<u64, String> {
    if n < i64::MIN as i128 || n > u64::MAX as i128 {
        return Err(format!("Integer literal {} out of range", n));
    }
    Ok(if n < 0 { n as i64 as u64 } else { n as u64 })
}

struct Line {
    number: usize,
    toks: Vec<Tok>,
}

struct Define {
    header: Line,
    body: Vec<Line>,
}

/// Local names within one function body
#[derive(Default)]
struct Scope {
    values: UnorderedMap<String, ValueId>,
    blocks: UnorderedMap<String, BlockId>,
}

struct Parser {
    m: Module,
}

fn at_line<T>(number: usize, r: Result<T, String>) -> Result<T, String> {
    r.map_err(|e| format!("Line {}: {}", number, e))
}

/// `unit "<name>"`
fn unit_line(toks: &[Tok]) -> Result<String, String> {
    let mut c = Cursor::new(toks);
    if !c.eat_word("unit") {
        return Err("Expected `unit \"<name>\"` first".to_owned());
    }
    let u = c.string()?.to_owned();
    c.end()?;
    Ok(u)
}

/// Parse a module from its textual form. Errors carry the offending line number.
pub fn parse_module(text: &str) -> Result<Module, String> {
    let mut lines = vec![];
    for (n, l) in text.lines().enumerate() {
        let toks = at_line(n + 1, tokenize(l))?;
        if !toks.is_empty() {
            lines.push(Line { number: n + 1, toks });
        }
    }
    let mut lines = lines.into_iter();

    let unit = match lines.next() {
        Some(l) => at_line(l.number, unit_line(&l.toks))?,
        None => return Err("Empty module".into()),
    };

    let mut structs = vec![];
    let mut globals = vec![];
    let mut functions = vec![];
    while let Some(l) = lines.next() {
        let kw = match l.toks.first() {
            Some(Tok::Word(w)) => w.clone(),
            t => return Err(format!("Line {}: Unexpected {:?}", l.number, t)),
        };
        match kw.as_str() {
            "struct" => structs.push(l),
            "global" => globals.push(l),
            "declare" => functions.push(Define {
                header: l,
                body: vec![],
            }),
            "define" => {
                let mut body = vec![];
                let mut closed = false;
                for b in lines.by_ref() {
                    if b.toks == [Tok::Punct('}')] {
                        closed = true;
                        break;
                    }
                    body.push(b);
                }
                if !closed {
                    return Err(format!("Line {}: Unterminated function body", l.number));
                }
                functions.push(Define { header: l, body });
            }
            w => return Err(format!("Line {}: Unknown item `{}`", l.number, w)),
        }
    }

    let mut p = Parser {
        m: Module::new(&unit),
    };
    let mut seen = UnorderedSet::default();
    for l in &structs {
        at_line(l.number, p.struct_name(&l.toks, &mut seen))?;
    }
    for l in &structs {
        at_line(l.number, p.struct_body(&l.toks))?;
    }
    let funcs = functions
        .iter()
        .map(|d| at_line(d.header.number, p.function_header(&d.header.toks)))
        .collect::<Result<Vec<_>, _>>()?;
    let gids = globals
        .iter()
        .map(|l| at_line(l.number, p.global_header(&l.toks)))
        .collect::<Result<Vec<_>, _>>()?;
    for (l, (g, rest)) in globals.iter().zip(gids) {
        at_line(l.number, p.global_rest(g, &l.toks[rest..]))?;
    }
    for (d, f) in functions.iter().zip(funcs) {
        p.function_body(f, &d.body)?;
    }
    Ok(p.m)
}

impl Parser {
    fn ty(&mut self, c: &mut Cursor) -> Result<TypeId, String> {
        let t = &mut self.m.types;
        match c.next()? {
            Tok::Local(name) => Ok(t.declare_struct(name)),
            Tok::Punct('[') => {
                let n = c.int()?;
                if n < 0 {
                    return Err("Negative array length".into());
                }
                if c.word()? != "x" {
                    return Err("Expected `x` in array type".into());
                }
                let element = self.ty(c)?;
                c.punct(']')?;
                Ok(self.m.types.array(element, n as u64))
            }
            Tok::Word(w) if w == "void" => Ok(t.void()),
            Tok::Word(w) if w == "ptr" => {
                c.punct('<')?;
                let pointee = self.ty(c)?;
                c.punct('>')?;
                Ok(self.m.types.ptr(pointee))
            }
            Tok::Word(w) if w == "fn" => {
                let params = self.type_list(c)?;
                match c.next()? {
                    Tok::Arrow => {}
                    t => return Err(format!("Expected `->`, got {:?}", t)),
                }
                let ret = self.ty(c)?;
                Ok(self.m.types.func(ret, params))
            }
            Tok::Word(w) if w.starts_with('i') => {
                let bits = w[1..]
                    .parse::<u32>()
                    .map_err(|_| format!("Unknown type {}", w))?;
                if bits == 0 {
                    return Err("Zero-width integer type".into());
                }
                Ok(t.int(bits))
            }
            tok => Err(format!("Expected a type, got {:?}", tok)),
        }
    }

    /// `(T, T, ..)`
    fn type_list(&mut self, c: &mut Cursor) -> Result<Vec<TypeId>, String> {
        c.punct('(')?;
        let mut r = vec![];
        if c.eat_punct(')') {
            return Ok(r);
        }
        loop {
            r.push(self.ty(c)?);
            if c.eat_punct(')') {
                return Ok(r);
            }
            c.punct(',')?;
        }
    }

    fn struct_name(&mut self, toks: &[Tok], seen: &mut UnorderedSet<String>) -> Result<TypeId, String> {
        let mut c = Cursor::new(toks);
        c.word()?;
        let name = c.local()?;
        if !seen.insert(name.to_owned()) {
            return Err(format!("Struct %{} defined twice", name));
        }
        Ok(self.m.types.declare_struct(name))
    }

    fn struct_body(&mut self, toks: &[Tok]) -> Result<(), String> {
        let mut c = Cursor::new(toks);
        c.word()?;
        let s = self.m.types.declare_struct(c.local()?);
        if c.eat_word("opaque") {
            return c.end();
        }
        c.punct('{')?;
        let mut fields = vec![];
        if !c.eat_punct('}') {
            loop {
                fields.push(self.ty(&mut c)?);
                if c.eat_punct('}') {
                    break;
                }
                c.punct(',')?;
            }
        }
        c.end()?;
        self.m.types.set_struct_body(s, fields);
        Ok(())
    }

    /// `section "s"` and `attrs(a, b)` suffixes of a function header
    fn function_suffix(&mut self, f: FuncId, c: &mut Cursor) -> Result<(), String> {
        loop {
            if c.eat_word("section") {
                let s = c.string()?.to_owned();
                self.m.function_mut(f).section = Some(s);
            } else if c.eat_word("attrs") {
                c.punct('(')?;
                while !c.eat_punct(')') {
                    let w = c.word()?;
                    let a = FnAttr::from_keyword(w).ok_or_else(|| format!("Unknown attribute {}", w))?;
                    self.m.function_mut(f).attrs.insert(a);
                    c.eat_punct(',');
                }
            } else {
                return Ok(());
            }
        }
    }

    fn function_header(&mut self, toks: &[Tok]) -> Result<FuncId, String> {
        let mut c = Cursor::new(toks);
        let is_define = c.word()? == "define";
        let name = c.global()?.to_owned();
        if self.m.function_named(&name).is_some() {
            return Err(format!("Function @{} defined twice", name));
        }
        let (params, names) = if is_define {
            c.punct('(')?;
            let mut params = vec![];
            let mut names = vec![];
            if !c.eat_punct(')') {
                loop {
                    names.push(c.local()?.to_owned());
                    c.punct(':')?;
                    params.push(self.ty(&mut c)?);
                    if c.eat_punct(')') {
                        break;
                    }
                    c.punct(',')?;
                }
            }
            (params, names)
        } else {
            (self.type_list(&mut c)?, vec![])
        };
        match c.next()? {
            Tok::Arrow => {}
            t => return Err(format!("Expected `->`, got {:?}", t)),
        }
        let ret = self.ty(&mut c)?;
        let fnty = self.m.types.func(ret, params);
        let names: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let f = self.m.declare_function(&name, fnty, &names);
        self.function_suffix(f, &mut c)?;
        if is_define {
            c.punct('{')?;
        }
        c.end()?;
        Ok(f)
    }

    /// Creates the global, returning it with the position of the rest of the line
    fn global_header(&mut self, toks: &[Tok]) -> Result<(GlobalId, usize), String> {
        let mut c = Cursor::new(toks);
        c.word()?;
        let name = c.global()?;
        if self.m.global_named(name).is_some() {
            return Err(format!("Global @{} defined twice", name));
        }
        c.punct(':')?;
        let ty = self.ty(&mut c)?;
        Ok((self.m.add_global(name, ty, None, None, false), c.pos))
    }

    fn global_rest(&mut self, g: GlobalId, toks: &[Tok]) -> Result<(), String> {
        let mut c = Cursor::new(toks);
        if c.eat_punct('=') {
            let init = self.initializer(&mut c)?;
            self.m.global_mut(g).initializer = Some(init);
        }
        loop {
            if c.eat_word("section") {
                let s = c.string()?.to_owned();
                self.m.global_mut(g).section = Some(s);
            } else if c.eat_word("internal") {
                self.m.global_mut(g).internal = true;
            } else if c.eat_word("unnamed_addr") {
                self.m.global_mut(g).unnamed_addr = true;
            } else {
                return c.end();
            }
        }
    }

    fn initializer(&mut self, c: &mut Cursor) -> Result<Initializer, String> {
        if c.eat_word("zeroinit") {
            return Ok(Initializer::Zero);
        }
        if c.eat_punct('{') {
            let mut elems = vec![];
            if !c.eat_punct('}') {
                loop {
                    elems.push(self.initializer(c)?);
                    if c.eat_punct('}') {
                        break;
                    }
                    c.punct(',')?;
                }
            }
            return Ok(Initializer::Aggregate(elems));
        }
        if let Some(Tok::Int(n)) = c.peek() {
            c.pos += 1;
            let bits = literal_bits(*n)?;
            if c.eat_punct(':') {
                self.ty(c)?;
            }
            return Ok(Initializer::Int(bits));
        }
        Ok(Initializer::Value(self.value(c, None)?))
    }

    /// An operand. `scope` is `None` outside function bodies.
    fn value(&mut self, c: &mut Cursor, scope: Option<&Scope>) -> Result<ValueId, String> {
        match c.next()? {
            Tok::Local(name) => scope
                .and_then(|s| s.values.get(name.as_str()).cloned())
                .ok_or_else(|| format!("Unknown value %{}", name)),
            Tok::Global(name) => {
                if let Some(g) = self.m.global_named(name) {
                    Ok(self.m.global(g).addr)
                } else if let Some(f) = self.m.function_named(name) {
                    Ok(self.m.function(f).addr)
                } else {
                    Err(format!("Unknown global @{}", name))
                }
            }
            Tok::Int(n) => {
                let bits = literal_bits(*n)?;
                c.punct(':')?;
                let ty = self.ty(c)?;
                if !matches!(self.m.types.get(ty), Type::Int { .. }) {
                    return Err(format!("Integer constant of type {}", self.m.types.name(ty)));
                }
                Ok(self.m.const_int(ty, bits))
            }
            Tok::Word(w) if w == "null" => {
                c.punct(':')?;
                let ty = self.ty(c)?;
                if !self.m.types.is_pointer(ty) {
                    return Err(format!("Null of type {}", self.m.types.name(ty)));
                }
                Ok(self.m.null(ty))
            }
            Tok::Word(w) if w == "undef" => {
                c.punct(':')?;
                let ty = self.ty(c)?;
                Ok(self.m.undef(ty))
            }
            Tok::Word(w) if w == "fieldaddr" => {
                c.punct('(')?;
                let source_ty = self.ty(c)?;
                c.punct(',')?;
                let base = self.value(c, scope)?;
                let mut indices = vec![];
                while c.eat_punct(',') {
                    indices.push(self.value(c, scope)?);
                }
                c.punct(')')?;
                let target = self.m.field_path(source_ty, &indices)?.target;
                let ty = self.m.types.ptr(target);
                Ok(self.m.const_expr(
                    ty,
                    ConstExpr::FieldAddr {
                        source_ty,
                        base,
                        indices,
                    },
                ))
            }
            Tok::Word(w) => match CastOp::from_keyword(w) {
                Some(op) => {
                    c.punct('(')?;
                    let src = self.value(c, scope)?;
                    c.punct(':')?;
                    let ty = self.ty(c)?;
                    c.punct(')')?;
                    Ok(self.m.const_expr(ty, ConstExpr::Cast { op, src }))
                }
                None => Err(format!("Unknown operand `{}`", w)),
            },
            t => Err(format!("Expected an operand, got {:?}", t)),
        }
    }

    /// `v, v, ..`, up to (and including) the closing `)`
    fn operand_list(&mut self, c: &mut Cursor, scope: &Scope) -> Result<Vec<ValueId>, String> {
        let mut r = vec![];
        if c.eat_punct(')') {
            return Ok(r);
        }
        loop {
            r.push(self.value(c, Some(scope))?);
            if c.eat_punct(')') {
                return Ok(r);
            }
            c.punct(',')?;
        }
    }

    fn label(&self, c: &mut Cursor, scope: &Scope) -> Result<BlockId, String> {
        let w = c.word()?;
        scope
            .blocks
            .get(w)
            .cloned()
            .ok_or_else(|| format!("Unknown block {}", w))
    }

    fn function_body(&mut self, f: FuncId, body: &[Line]) -> Result<(), String> {
        let mut scope = Scope::default();
        for &p in &self.m.function(f).params {
            if let Some(n) = self.m.name_of(p) {
                scope.values.insert(n.to_owned(), p);
            }
        }

        // Blocks and result values first, so that later lines can be referred to
        let mut placeholders: UnorderedMap<usize, InstId> = Default::default();
        for l in body {
            let mut c = Cursor::new(&l.toks);
            match (c.next(), c.peek()) {
                (Ok(Tok::Word(w)), Some(Tok::Punct(':'))) if l.toks.len() == 2 => {
                    if scope.blocks.contains_key(w.as_str()) {
                        return Err(format!("Line {}: Block {} defined twice", l.number, w));
                    }
                    let b = self.m.add_block(f, w);
                    scope.blocks.insert(w.clone(), b);
                }
                (Ok(Tok::Local(name)), Some(Tok::Punct(':'))) => {
                    c.pos += 1;
                    let ty = at_line(l.number, self.ty(&mut c))?;
                    if scope.values.contains_key(name.as_str()) {
                        return Err(format!("Line {}: Value %{} defined twice", l.number, name));
                    }
                    let i = self.m.create_inst(
                        InstKind::Phi { incoming: vec![] },
                        Some((ty, Some(name.clone()))),
                    );
                    scope.values.insert(name.clone(), self.m.result(i));
                    placeholders.insert(l.number, i);
                }
                _ => {}
            }
        }

        let mut current = None;
        for l in body {
            if let (Some(Tok::Word(w)), Some(Tok::Punct(':')), 2) =
                (l.toks.first(), l.toks.get(1), l.toks.len())
            {
                current = scope.blocks.get(w.as_str()).cloned();
                continue;
            }
            let b = current.ok_or_else(|| format!("Line {}: Instruction outside a block", l.number))?;
            let mut c = Cursor::new(&l.toks);
            let i = match placeholders.get(&l.number) {
                Some(&i) => {
                    // Skip `%x: T =`
                    c.next()?;
                    c.punct(':')?;
                    at_line(l.number, self.ty(&mut c))?;
                    at_line(l.number, c.punct('='))?;
                    let kind = at_line(l.number, self.inst_kind(&mut c, &scope))?;
                    self.m.inst_mut(i).kind = kind;
                    i
                }
                None => {
                    let kind = at_line(l.number, self.inst_kind(&mut c, &scope))?;
                    self.m.create_inst(kind, None)
                }
            };
            if let Some(Tok::Marker(m)) = c.peek() {
                if m != "instrumented" {
                    return Err(format!("Line {}: Unknown marker !{}", l.number, m));
                }
                c.pos += 1;
                self.m.inst_mut(i).instrumented = true;
            }
            at_line(l.number, c.end())?;
            self.m.append_inst(b, i);
        }
        Ok(())
    }

    fn inst_kind(&mut self, c: &mut Cursor, scope: &Scope) -> Result<InstKind, String> {
        let op = c.word()?;
        let s = Some(scope);
        let kind = match op {
            "load" => InstKind::Load {
                addr: self.value(c, s)?,
            },
            "store" => {
                let value = self.value(c, s)?;
                c.punct(',')?;
                let addr = self.value(c, s)?;
                InstKind::Store { value, addr }
            }
            "fieldaddr" => {
                let source_ty = self.ty(c)?;
                c.punct(',')?;
                let base = self.value(c, s)?;
                let mut indices = vec![];
                while c.eat_punct(',') {
                    indices.push(self.value(c, s)?);
                }
                InstKind::FieldAddr {
                    source_ty,
                    base,
                    indices,
                }
            }
            "call" => {
                let callee = self.value(c, s)?;
                c.punct('(')?;
                let args = self.operand_list(c, scope)?;
                InstKind::Call { callee, args }
            }
            "br" => {
                if let Some(Tok::Word(_)) = c.peek() {
                    InstKind::Br {
                        target: self.label(c, scope)?,
                    }
                } else {
                    let cond = self.value(c, s)?;
                    c.punct(',')?;
                    let on_true = self.label(c, scope)?;
                    c.punct(',')?;
                    let on_false = self.label(c, scope)?;
                    InstKind::CondBr {
                        cond,
                        on_true,
                        on_false,
                    }
                }
            }
            "phi" => {
                let mut incoming = vec![];
                loop {
                    c.punct('[')?;
                    let v = self.value(c, s)?;
                    c.punct(',')?;
                    let b = self.label(c, scope)?;
                    c.punct(']')?;
                    incoming.push((v, b));
                    if !c.eat_punct(',') {
                        break;
                    }
                }
                InstKind::Phi { incoming }
            }
            "icmp" => {
                let w = c.word()?;
                let pred = CmpPred::from_keyword(w).ok_or_else(|| format!("Unknown predicate {}", w))?;
                let lhs = self.value(c, s)?;
                c.punct(',')?;
                let rhs = self.value(c, s)?;
                InstKind::Cmp { pred, lhs, rhs }
            }
            "select" => {
                let cond = self.value(c, s)?;
                c.punct(',')?;
                let on_true = self.value(c, s)?;
                c.punct(',')?;
                let on_false = self.value(c, s)?;
                InstKind::Select {
                    cond,
                    on_true,
                    on_false,
                }
            }
            "alloca" => InstKind::Alloca { ty: self.ty(c)? },
            "ret" => match c.peek() {
                None | Some(Tok::Marker(_)) => InstKind::Ret { value: None },
                Some(_) => InstKind::Ret {
                    value: Some(self.value(c, s)?),
                },
            },
            w => {
                if let Some(op) = CastOp::from_keyword(w) {
                    InstKind::Cast {
                        op,
                        src: self.value(c, s)?,
                    }
                } else if let Some(op) = BinOp::from_keyword(w) {
                    let lhs = self.value(c, s)?;
                    c.punct(',')?;
                    let rhs = self.value(c, s)?;
                    InstKind::Binary { op, lhs, rhs }
                } else {
                    return Err(format!("Unknown operation `{}`", w));
                }
            }
        };
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_references_resolve() {
        let m = parse_module(
            r#"
unit "t.c"
; a comment
global @table : [2 x ptr<fn() -> void>] = { @a, null:ptr<fn() -> void> }
define @a() -> void {
entry:
  br later
later:
  %z: i64 = add %y, 1:i64
  ret
more:
  %y: i64 = add 0:i64, -1:i64
  br later
}
"#,
        )
        .unwrap();
        m.confirm_valid();
        let y = m.value_named("y").unwrap();
        let add = m.producer(y).unwrap();
        match &m.inst(add).kind {
            InstKind::Binary { rhs, .. } => assert_eq!(m.const_value(*rhs), Some(u64::MAX)),
            k => panic!("Unexpected {:?}", k),
        }
        let a = m.function_named("a").unwrap();
        assert_eq!(m.function(a).blocks.len(), 3);
    }

    #[test]
    fn errors_carry_line_numbers() {
        let e = parse_module("unit \"t.c\"\nglobal @g : i64 = @nope\n").unwrap_err();
        assert!(e.starts_with("Line 2:"), "{}", e);
        let e = parse_module("unit \"t.c\"\ndefine @f() -> void {\nentry:\n  ret %x\n}\n").unwrap_err();
        assert!(e.starts_with("Line 4:"), "{}", e);
        assert!(parse_module("struct %s opaque\n").is_err());
        assert!(parse_module("unit \"t.c\"\ndefine @f() -> void {\nentry:\n").is_err());
    }
}
