//! Tree-walking interpreter with operation, time, depth and size budgets.
//!
//! Runs on a blocking thread. Values are single-threaded (`Rc`) and never leave the thread: the
//! context comes in as JSON and only a [`Decision`] goes out.
use std::{
    collections::{BTreeMap, HashMap},
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use derive_more::From;
use regex::RegexBuilder;

use super::{
    http::{HttpCapability, HttpMethod, HttpRequest},
    parser::{BinaryOp, Expr, Function, Literal, LogicalOp, Program, Stmt, Target, UnaryOp},
    Decision, EvaluationError,
};

/// Compiled size limit for regular expressions passed to `matches`.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// How often, in operations, the wall clock is consulted.
const CLOCK_CHECK_INTERVAL: u64 = 64;

/// Deepest arrays and objects a script may build.
const MAX_VALUE_DEPTH: usize = 64;

/// Deepest recursion of statements and expressions across all active calls. Bounds the native
/// stack the interpreter uses.
const MAX_EVAL_DEPTH: usize = 256;

type Eval<T> = std::result::Result<T, EvaluationError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Builtin {
    Enabled,
    Disabled,
    HttpGet,
    HttpPost,
}

#[derive(Debug, Clone, From)]
pub(crate) enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    /// Items and nesting depth.
    #[from(ignore)]
    Array(Rc<Vec<Value>>, usize),
    /// Properties and nesting depth.
    #[from(ignore)]
    Object(Rc<BTreeMap<String, Value>>, usize),
    Builtin(Builtin),
    Function(Arc<Function>),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value.into())
    }
}

impl From<&serde_json::Value> for Value {
    fn from(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::from(*b),
            serde_json::Value::Number(n) => Value::from(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::from(s.as_str()),
            serde_json::Value::Array(items) => {
                Value::array(items.iter().map(Value::from).collect())
            }
            serde_json::Value::Object(fields) => Value::object(
                fields
                    .iter()
                    .map(|(name, value)| (name.clone(), Value::from(value)))
                    .collect(),
            ),
        }
    }
}

impl Value {
    fn array(items: Vec<Value>) -> Value {
        let depth = 1 + items.iter().map(Value::depth).max().unwrap_or(0);
        Value::Array(Rc::new(items), depth)
    }

    fn object(fields: BTreeMap<String, Value>) -> Value {
        let depth = 1 + fields.values().map(Value::depth).max().unwrap_or(0);
        Value::Object(Rc::new(fields), depth)
    }

    fn depth(&self) -> usize {
        match self {
            Value::Array(_, depth) | Value::Object(_, depth) => *depth,
            _ => 0,
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Array(..) | Value::Object(..) | Value::Builtin(_) | Value::Function(_) => true,
        }
    }

    /// `===`: primitives by value, arrays, objects and functions by identity.
    fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a, _), Value::Array(b, _)) => Rc::ptr_eq(a, b),
            (Value::Object(a, _), Value::Object(b, _)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(..) => "array",
            Value::Object(..) => "object",
            Value::Builtin(_) | Value::Function(_) => "function",
        }
    }
}

fn check_depth(depth: usize) -> Eval<()> {
    if depth > MAX_VALUE_DEPTH {
        return Err(EvaluationError::ResourceLimit(format!(
            "value nested deeper than {MAX_VALUE_DEPTH}"
        )));
    }
    Ok(())
}

fn number_text(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        (n as i64).to_string()
    } else {
        n.to_string()
    }
}

/// Budgets of a single evaluation.
#[derive(Debug, Clone)]
pub(crate) struct Limits {
    pub deadline: Instant,
    pub max_operations: u64,
    pub max_call_depth: usize,
    pub max_value_len: usize,
    pub http_timeout: Duration,
}

enum Flow {
    Next,
    Return(Value),
}

struct Interpreter<'a> {
    limits: &'a Limits,
    cancelled: &'a AtomicBool,
    http: &'a dyn HttpCapability,
    operations: u64,
    /// Active function calls.
    depth: usize,
    /// Active statements and expressions, across calls.
    nesting: usize,
    /// Capabilities. Visible everywhere, never assignable.
    globals: HashMap<String, Value>,
    /// Top-level bindings, visible from every function.
    root: HashMap<String, Value>,
    /// Block scopes of the running function (or of top-level blocks).
    scopes: Vec<HashMap<String, Value>>,
    decision: Option<Decision>,
}

fn thrown(message: impl Into<String>) -> EvaluationError {
    EvaluationError::Thrown(message.into())
}

/// Run `program` to completion and return the decision it made.
pub(crate) fn run(
    program: &Program,
    context: &serde_json::Value,
    limits: &Limits,
    cancelled: &AtomicBool,
    http: &dyn HttpCapability,
) -> Result<Decision, EvaluationError> {
    let http_object = [
        ("get".to_owned(), Value::from(Builtin::HttpGet)),
        ("post".to_owned(), Value::from(Builtin::HttpPost)),
    ]
    .into_iter()
    .collect();
    let capabilities = [
        Value::from(context),
        Value::from(Builtin::Enabled),
        Value::from(Builtin::Disabled),
        Value::object(http_object),
    ];

    let mut globals = HashMap::new();
    globals.insert("markEnabled".to_owned(), Value::from(Builtin::Enabled));
    globals.insert("markDisabled".to_owned(), Value::from(Builtin::Disabled));
    for (name, value) in program
        .params
        .iter()
        .zip(capabilities.into_iter().chain(std::iter::repeat(Value::Null)))
    {
        globals.insert(name.clone(), value);
    }

    let mut interpreter = Interpreter {
        limits,
        cancelled,
        http,
        operations: 0,
        depth: 0,
        nesting: 0,
        globals,
        root: HashMap::new(),
        scopes: Vec::new(),
        decision: None,
    };
    interpreter.statements(&program.body)?;
    interpreter.decision.ok_or(EvaluationError::NoDecision)
}

impl Interpreter<'_> {
    fn step(&mut self) -> Eval<()> {
        self.operations += 1;
        if self.operations > self.limits.max_operations {
            return Err(EvaluationError::ResourceLimit(format!(
                "operation budget of {} exhausted",
                self.limits.max_operations
            )));
        }
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(EvaluationError::Timeout);
        }
        if self.operations % CLOCK_CHECK_INTERVAL == 0 && Instant::now() >= self.limits.deadline {
            return Err(EvaluationError::Timeout);
        }
        Ok(())
    }

    fn check_len(&self, len: usize, what: &str) -> Eval<()> {
        if len > self.limits.max_value_len {
            return Err(EvaluationError::ResourceLimit(format!(
                "{what} of length {len} exceeds {}",
                self.limits.max_value_len
            )));
        }
        Ok(())
    }

    fn container(&self, value: Value) -> Eval<Value> {
        check_depth(value.depth())?;
        Ok(value)
    }

    /// Run `eval` one level deeper, failing once [`MAX_EVAL_DEPTH`] levels are active.
    fn nested<T>(&mut self, eval: impl FnOnce(&mut Self) -> Eval<T>) -> Eval<T> {
        if self.nesting >= MAX_EVAL_DEPTH {
            return Err(EvaluationError::ResourceLimit(format!(
                "evaluation nested deeper than {MAX_EVAL_DEPTH}"
            )));
        }
        self.nesting += 1;
        let result = eval(self);
        self.nesting -= 1;
        result
    }

    /// Append the string form of `value` to `out`. Every element visited is one operation, and
    /// the output may not grow past the value size limit.
    fn render(&mut self, value: &Value, out: &mut String) -> Eval<()> {
        self.step()?;
        match value {
            Value::Null => out.push_str("null"),
            Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Value::Number(n) => out.push_str(&number_text(*n)),
            Value::String(s) => out.push_str(s),
            Value::Array(items, _) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    self.render(item, out)?;
                }
            }
            Value::Object(..) => out.push_str("[object Object]"),
            Value::Builtin(_) | Value::Function(_) => out.push_str("function"),
        }
        self.check_len(out.len(), "string")
    }

    fn text(&mut self, value: &Value) -> Eval<String> {
        let mut out = String::new();
        self.render(value, &mut out)?;
        Ok(out)
    }

    /// JSON form of `value`, metered like [`Interpreter::render`]. `size` accumulates the string
    /// bytes and elements emitted.
    fn to_json(&mut self, value: &Value, size: &mut usize) -> Eval<serde_json::Value> {
        self.step()?;
        *size += 1;
        let json = match value {
            Value::Null | Value::Builtin(_) | Value::Function(_) => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => {
                *size += s.len();
                self.check_len(*size, "request body")?;
                serde_json::Value::String(s.to_string())
            }
            Value::Array(items, _) => {
                let mut array = Vec::with_capacity(items.len());
                for item in items.iter() {
                    array.push(self.to_json(item, size)?);
                }
                serde_json::Value::Array(array)
            }
            Value::Object(fields, _) => {
                let mut object = serde_json::Map::new();
                for (name, value) in fields.iter() {
                    *size += name.len();
                    let value = self.to_json(value, size)?;
                    object.insert(name.clone(), value);
                }
                serde_json::Value::Object(object)
            }
        };
        self.check_len(*size, "request body")?;
        Ok(json)
    }

    fn declare(&mut self, name: &str, value: Value) {
        let scope = match self.scopes.last_mut() {
            Some(scope) => scope,
            None => &mut self.root,
        };
        scope.insert(name.to_owned(), value);
    }

    fn lookup(&self, name: &str) -> Eval<Value> {
        self.scopes
            .iter()
            .rev()
            .chain([&self.root, &self.globals])
            .find_map(|scope| scope.get(name))
            .cloned()
            .ok_or_else(|| thrown(format!("{name} is not defined")))
    }

    fn variable_mut(&mut self, name: &str) -> Eval<&mut Value> {
        if let Some(value) = self
            .scopes
            .iter_mut()
            .rev()
            .chain([&mut self.root])
            .find_map(|scope| scope.get_mut(name))
        {
            return Ok(value);
        }
        if self.globals.contains_key(name) {
            Err(thrown(format!("cannot assign to {name}")))
        } else {
            Err(thrown(format!("{name} is not defined")))
        }
    }

    fn block(&mut self, body: &[Stmt]) -> Eval<Flow> {
        self.scopes.push(HashMap::new());
        let flow = self.statements(body);
        self.scopes.pop();
        flow
    }

    fn statements(&mut self, body: &[Stmt]) -> Eval<Flow> {
        // Function declarations are hoisted to the top of their block.
        for stmt in body {
            if let Stmt::Function(function) = stmt {
                self.declare(&function.name, Value::from(function.clone()));
            }
        }
        for stmt in body {
            if let Flow::Return(value) = self.statement(stmt)? {
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Next)
    }

    fn statement(&mut self, stmt: &Stmt) -> Eval<Flow> {
        self.step()?;
        self.nested(|interpreter| interpreter.statement_inner(stmt))
    }

    fn statement_inner(&mut self, stmt: &Stmt) -> Eval<Flow> {
        match stmt {
            Stmt::Let(name, value) => {
                let value = match value {
                    Some(value) => self.expr(value)?,
                    None => Value::Null,
                };
                self.declare(name, value);
            }
            Stmt::Assign(Target::Variable(name), value) => {
                let value = self.expr(value)?;
                *self.variable_mut(name)? = value;
            }
            Stmt::Assign(Target::Property(name, key), value) => {
                let key = self.expr(key)?;
                let value = self.expr(value)?;
                self.set_property(name, key, value)?;
            }
            Stmt::Expr(expr) => {
                self.expr(expr)?;
            }
            Stmt::If(condition, then, otherwise) => {
                let branch = if self.expr(condition)?.truthy() {
                    then
                } else {
                    otherwise
                };
                return self.block(branch);
            }
            Stmt::While(condition, body) => {
                while self.expr(condition)?.truthy() {
                    if let Flow::Return(value) = self.block(body)? {
                        return Ok(Flow::Return(value));
                    }
                }
            }
            Stmt::Return(value) => {
                let value = match value {
                    Some(value) => self.expr(value)?,
                    None => Value::Null,
                };
                return Ok(Flow::Return(value));
            }
            Stmt::Throw(value) => {
                let value = self.expr(value)?;
                let message = match &value {
                    Value::Object(fields, _) => match fields.get("message") {
                        Some(message) => self.text(message)?,
                        None => self.text(&value)?,
                    },
                    value => self.text(value)?,
                };
                return Err(EvaluationError::Thrown(message));
            }
            Stmt::Function(function) => {
                self.declare(&function.name, Value::from(function.clone()));
            }
        }
        Ok(Flow::Next)
    }

    fn set_property(&mut self, name: &str, key: Value, value: Value) -> Eval<()> {
        let max_len = self.limits.max_value_len;
        let nested_depth = value.depth() + 1;
        check_depth(nested_depth)?;
        let property = self.text(&key)?;
        match (self.variable_mut(name)?, key) {
            (Value::Object(fields, depth), _) => {
                let fields = Rc::make_mut(fields);
                if !fields.contains_key(&property) && fields.len() >= max_len {
                    return Err(EvaluationError::ResourceLimit(format!(
                        "object exceeds {max_len} properties"
                    )));
                }
                fields.insert(property, value);
                *depth = (*depth).max(nested_depth);
            }
            (Value::Array(items, depth), Value::Number(index)) => {
                if index < 0.0 || index.fract() != 0.0 {
                    return Err(thrown(format!("invalid array index {index}")));
                }
                let index = index as usize;
                if index >= max_len {
                    return Err(EvaluationError::ResourceLimit(format!(
                        "array exceeds {max_len} items"
                    )));
                }
                let items = Rc::make_mut(items);
                if index >= items.len() {
                    items.resize(index + 1, Value::Null);
                }
                items[index] = value;
                *depth = (*depth).max(nested_depth);
            }
            (target, _) => {
                return Err(thrown(format!(
                    "cannot set a property on {}",
                    target.type_name()
                )))
            }
        }
        Ok(())
    }

    fn expr(&mut self, expr: &Expr) -> Eval<Value> {
        self.step()?;
        self.nested(|interpreter| interpreter.expr_inner(expr))
    }

    fn expr_inner(&mut self, expr: &Expr) -> Eval<Value> {
        match expr {
            Expr::Literal(literal) => Ok(match literal {
                Literal::Null => Value::Null,
                Literal::Bool(b) => Value::from(*b),
                Literal::Number(n) => Value::from(*n),
                Literal::Str(s) => Value::from(s.as_str()),
            }),
            Expr::Ident(name) => self.lookup(name),
            Expr::Array(items) => {
                self.check_len(items.len(), "array")?;
                let items = items
                    .iter()
                    .map(|item| self.expr(item))
                    .collect::<Eval<Vec<_>>>()?;
                self.container(Value::array(items))
            }
            Expr::Object(fields) => {
                self.check_len(fields.len(), "object")?;
                let mut object = BTreeMap::new();
                for (name, value) in fields {
                    let value = self.expr(value)?;
                    object.insert(name.clone(), value);
                }
                self.container(Value::object(object))
            }
            Expr::Unary(UnaryOp::Not, operand) => Ok(Value::from(!self.expr(operand)?.truthy())),
            Expr::Unary(UnaryOp::Neg, operand) => match self.expr(operand)? {
                Value::Number(n) => Ok(Value::from(-n)),
                other => Err(thrown(format!("cannot negate {}", other.type_name()))),
            },
            Expr::Logical(op, left, right) => {
                let left = self.expr(left)?;
                let short_circuits = match op {
                    LogicalOp::And => !left.truthy(),
                    LogicalOp::Or => left.truthy(),
                };
                if short_circuits {
                    Ok(left)
                } else {
                    self.expr(right)
                }
            }
            Expr::Binary(op, left, right) => {
                let left = self.expr(left)?;
                let right = self.expr(right)?;
                self.binary(*op, left, right)
            }
            Expr::Member(object, property) => {
                let object = self.expr(object)?;
                property_of(&object, property)
            }
            Expr::Index(object, index) => {
                let object = self.expr(object)?;
                let index = self.expr(index)?;
                match (&object, &index) {
                    (Value::Array(items, _), Value::Number(n)) => Ok(element(items, *n)),
                    (Value::String(s), Value::Number(n)) => Ok(if *n >= 0.0 && n.fract() == 0.0 {
                        s.chars()
                            .nth(*n as usize)
                            .map(|c| Value::from(c.to_string()))
                            .unwrap_or(Value::Null)
                    } else {
                        Value::Null
                    }),
                    _ => {
                        let name = self.text(&index)?;
                        property_of(&object, &name)
                    }
                }
            }
            Expr::Call(callee, args) => {
                if let Expr::Member(receiver, name) = &**callee {
                    let receiver = self.expr(receiver)?;
                    let args = self.args(args)?;
                    if let Some(result) = self.method(&receiver, name, &args)? {
                        return Ok(result);
                    }
                    let function = property_of(&receiver, name)?;
                    return self.invoke(function, args);
                }
                let function = self.expr(callee)?;
                let args = self.args(args)?;
                self.invoke(function, args)
            }
        }
    }

    fn args(&mut self, args: &[Expr]) -> Eval<Vec<Value>> {
        args.iter().map(|arg| self.expr(arg)).collect()
    }

    fn binary(&mut self, op: BinaryOp, left: Value, right: Value) -> Eval<Value> {
        let type_error = |left: &Value, right: &Value| {
            thrown(format!(
                "unsupported operands for {op:?}: {} and {}",
                left.type_name(),
                right.type_name()
            ))
        };
        match op {
            BinaryOp::Eq => Ok(Value::from(left.strict_equals(&right))),
            BinaryOp::NotEq => Ok(Value::from(!left.strict_equals(&right))),
            BinaryOp::Add => match (&left, &right) {
                (Value::Number(a), Value::Number(b)) => Ok(Value::from(a + b)),
                (Value::String(_), _) | (_, Value::String(_)) => {
                    let mut out = String::new();
                    self.render(&left, &mut out)?;
                    self.render(&right, &mut out)?;
                    Ok(Value::from(out))
                }
                _ => Err(type_error(&left, &right)),
            },
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
                let (Value::Number(a), Value::Number(b)) = (&left, &right) else {
                    return Err(type_error(&left, &right));
                };
                Ok(Value::from(match op {
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    _ => a % b,
                }))
            }
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
                let ordering = match (&left, &right) {
                    (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
                    (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                    _ => return Err(type_error(&left, &right)),
                };
                Ok(Value::from(ordering.is_some_and(|ordering| match op {
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::LtEq => ordering.is_le(),
                    BinaryOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                })))
            }
        }
    }

    /// Built-in methods of strings and arrays. `None` when `name` is not one.
    fn method(&self, receiver: &Value, name: &str, args: &[Value]) -> Eval<Option<Value>> {
        let string_arg = || match args.first() {
            Some(Value::String(s)) => Ok(s.clone()),
            _ => Err(thrown(format!("{name} expects a string argument"))),
        };
        let result = match (receiver, name) {
            (Value::String(s), "startsWith") => Value::from(s.starts_with(&*string_arg()?)),
            (Value::String(s), "endsWith") => Value::from(s.ends_with(&*string_arg()?)),
            (Value::String(s), "includes") => Value::from(s.contains(&*string_arg()?)),
            (Value::String(s), "toLowerCase") => Value::from(s.to_lowercase()),
            (Value::String(s), "toUpperCase") => Value::from(s.to_uppercase()),
            (Value::String(s), "matches") => {
                let pattern = string_arg()?;
                let regex = RegexBuilder::new(&pattern)
                    .size_limit(REGEX_SIZE_LIMIT)
                    .build()
                    .map_err(|err| thrown(format!("invalid pattern: {err}")))?;
                Value::from(regex.is_match(s))
            }
            (Value::Array(items, _), "includes") => {
                let needle = args.first().cloned().unwrap_or(Value::Null);
                Value::from(items.iter().any(|item| item.strict_equals(&needle)))
            }
            _ => return Ok(None),
        };
        Ok(Some(result))
    }

    fn invoke(&mut self, function: Value, args: Vec<Value>) -> Eval<Value> {
        match function {
            Value::Builtin(Builtin::Enabled) => self.decide(Decision::Enabled),
            Value::Builtin(Builtin::Disabled) => self.decide(Decision::Disabled),
            Value::Builtin(Builtin::HttpGet) => self.http_call(HttpMethod::Get, args),
            Value::Builtin(Builtin::HttpPost) => self.http_call(HttpMethod::Post, args),
            Value::Function(function) => self.call_function(&function, args),
            other => Err(thrown(format!("{} is not a function", other.type_name()))),
        }
    }

    fn decide(&mut self, decision: Decision) -> Eval<Value> {
        if self.decision.is_some() {
            return Err(EvaluationError::DoubleDecision);
        }
        self.decision = Some(decision);
        Ok(Value::Null)
    }

    fn call_function(&mut self, function: &Function, args: Vec<Value>) -> Eval<Value> {
        if self.depth >= self.limits.max_call_depth {
            return Err(EvaluationError::ResourceLimit(format!(
                "call depth of {} exceeded",
                self.limits.max_call_depth
            )));
        }
        let locals: HashMap<String, Value> = function
            .params
            .iter()
            .cloned()
            .zip(args.into_iter().chain(std::iter::repeat(Value::Null)))
            .collect();
        let caller_scopes = std::mem::replace(&mut self.scopes, vec![locals]);
        self.depth += 1;
        let flow = self.statements(&function.body);
        self.depth -= 1;
        self.scopes = caller_scopes;
        match flow? {
            Flow::Return(value) => Ok(value),
            Flow::Next => Ok(Value::Null),
        }
    }

    fn http_call(&mut self, method: HttpMethod, args: Vec<Value>) -> Eval<Value> {
        let url = match args.first() {
            Some(Value::String(url)) => url.to_string(),
            _ => return Err(thrown("http request expects a url string")),
        };
        let body = match (method, args.get(1)) {
            (HttpMethod::Get, _) => None,
            (HttpMethod::Post, None) => Some(serde_json::Value::Null),
            (HttpMethod::Post, Some(body)) => Some(self.to_json(body, &mut 0)?),
        };
        let remaining = self
            .limits
            .deadline
            .saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(EvaluationError::Timeout);
        }
        let request = HttpRequest { method, url, body };
        let response = self
            .http
            .call(&request, remaining.min(self.limits.http_timeout));
        if self.cancelled.load(Ordering::Relaxed) || Instant::now() >= self.limits.deadline {
            return Err(EvaluationError::Timeout);
        }
        let response = response.map_err(|err| thrown(format!("http request failed: {err}")))?;
        let body = match serde_json::from_str::<serde_json::Value>(&response.body) {
            Ok(json) => Value::from(&json),
            Err(_) => Value::from(response.body),
        };
        let fields = [
            ("status".to_owned(), Value::from(f64::from(response.status))),
            (
                "ok".to_owned(),
                Value::from((200..300).contains(&response.status)),
            ),
            ("body".to_owned(), body),
        ]
        .into_iter()
        .collect();
        Ok(Value::object(fields))
    }
}

fn element(items: &[Value], index: f64) -> Value {
    if index >= 0.0 && index.fract() == 0.0 {
        items.get(index as usize).cloned().unwrap_or(Value::Null)
    } else {
        Value::Null
    }
}

fn property_of(object: &Value, name: &str) -> Eval<Value> {
    Ok(match object {
        Value::Null => return Err(thrown(format!("cannot read property {name} of null"))),
        Value::String(s) if name == "length" => Value::from(s.chars().count() as f64),
        Value::Array(items, _) if name == "length" => Value::from(items.len() as f64),
        Value::Object(fields, _) => fields.get(name).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::script::{http::HttpResponse, parser::parse};

    struct Echo;

    impl HttpCapability for Echo {
        fn call(&self, request: &HttpRequest, _timeout: Duration) -> Result<HttpResponse, String> {
            if request.url.contains("down") {
                return Err("connection refused".to_owned());
            }
            Ok(HttpResponse {
                status: 200,
                body: json!({"url": request.url, "sent": request.body}).to_string(),
            })
        }
    }

    fn limits() -> Limits {
        Limits {
            deadline: Instant::now() + Duration::from_secs(5),
            max_operations: 100_000,
            max_call_depth: 16,
            max_value_len: 1024,
            http_timeout: Duration::from_secs(1),
        }
    }

    fn eval_with(source: &str, context: serde_json::Value, limits: &Limits) -> Eval<Decision> {
        let program = parse(source).unwrap();
        run(&program, &context, limits, &AtomicBool::new(false), &Echo)
    }

    fn eval(source: &str, context: serde_json::Value) -> Eval<Decision> {
        eval_with(source, context, &limits())
    }

    #[test]
    fn decides_on_context() {
        let source = r#"if context.user == "a@b.com" then enabled() else disabled()"#;
        assert_eq!(eval(source, json!({"user": "a@b.com"})), Ok(Decision::Enabled));
        assert_eq!(eval(source, json!({"user": "x@y.com"})), Ok(Decision::Disabled));
        assert_eq!(eval(source, json!({})), Ok(Decision::Disabled));
    }

    #[test]
    fn supports_functions_loops_and_methods() {
        let source = r#"
            function isStaff(email) {
                return email.toLowerCase().endsWith("@corp.com")
            }
            let total = 0
            let i = 0
            while (i < context.scores.length) {
                total = total + context.scores[i]
                i = i + 1
            }
            if (isStaff(context.email) && total >= 10 && context.tags.includes("beta")) {
                markEnabled()
            } else {
                markDisabled()
            }
        "#;
        let context = json!({"email": "Ann@Corp.com", "scores": [4, 6], "tags": ["beta"]});
        assert_eq!(eval(source, context), Ok(Decision::Enabled));
    }

    #[test]
    fn callbacks_must_be_called_exactly_once() {
        assert_eq!(eval("let x = 1", json!({})), Err(EvaluationError::NoDecision));
        assert_eq!(
            eval("enabled(); disabled()", json!({})),
            Err(EvaluationError::DoubleDecision)
        );
        assert_eq!(
            eval("enabled(); enabled()", json!({})),
            Err(EvaluationError::DoubleDecision)
        );
        // Returning early from a top-level script is allowed.
        assert_eq!(
            eval("disabled(); return; enabled()", json!({})),
            Ok(Decision::Disabled)
        );
    }

    #[test]
    fn surfaces_script_errors_as_thrown() {
        assert_eq!(
            eval("throw {message: 'nope'}", json!({})),
            Err(EvaluationError::Thrown("nope".to_owned()))
        );
        assert!(matches!(
            eval("context.missing.field == 1", json!({})),
            Err(EvaluationError::Thrown(_))
        ));
        assert!(matches!(
            eval("let x = 1 - 'a'", json!({})),
            Err(EvaluationError::Thrown(_))
        ));
        assert!(matches!(
            eval("require('fs')", json!({})),
            Err(EvaluationError::Thrown(message)) if message.contains("not defined")
        ));
        assert!(matches!(
            eval("context = 1", json!({})),
            Err(EvaluationError::Thrown(_))
        ));
    }

    #[test]
    fn equality_is_strict() {
        assert_eq!(
            eval("if (context.n == '1') enabled() else disabled()", json!({"n": 1})),
            Ok(Decision::Disabled)
        );
        assert_eq!(
            eval("if ('' + context.n === '1') enabled() else disabled()", json!({"n": 1})),
            Ok(Decision::Enabled)
        );
    }

    #[test]
    fn assignments_do_not_leak_into_the_context() {
        let context = json!({"user": {"plan": "free"}});
        let source = "let u = context.user; u.plan = 'pro'; \
            if (context.user.plan == 'free' && u.plan == 'pro') enabled()";
        assert_eq!(eval(source, context), Ok(Decision::Enabled));
    }

    #[test]
    fn matches_regular_expressions() {
        let source = r#"if (context.ip.matches("^10\\.")) enabled() else disabled()"#;
        assert_eq!(eval(source, json!({"ip": "10.0.0.1"})), Ok(Decision::Enabled));
        assert!(matches!(
            eval("context.ip.matches('(')", json!({"ip": "x"})),
            Err(EvaluationError::Thrown(_))
        ));
    }

    #[test]
    fn enforces_operation_budget() {
        let mut limits = limits();
        limits.max_operations = 1_000;
        assert!(matches!(
            eval_with("while (true) {}", json!({}), &limits),
            Err(EvaluationError::ResourceLimit(_))
        ));
    }

    #[test]
    fn enforces_deadline() {
        let mut limits = limits();
        limits.max_operations = u64::MAX;
        limits.deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(
            eval_with("while (true) {}", json!({}), &limits),
            Err(EvaluationError::Timeout)
        );
    }

    #[test]
    fn stops_when_cancelled() {
        let program = parse("while (true) {}").unwrap();
        let cancelled = AtomicBool::new(true);
        assert_eq!(
            run(&program, &json!({}), &limits(), &cancelled, &Echo),
            Err(EvaluationError::Timeout)
        );
    }

    #[test]
    fn enforces_call_depth() {
        let source = "function f(n) { return f(n + 1) } f(0)";
        assert!(matches!(
            eval(source, json!({})),
            Err(EvaluationError::ResourceLimit(message)) if message.contains("call depth")
        ));
    }

    #[test]
    fn enforces_value_size() {
        let source = "let s = 'x'; while (true) { s = s + s }";
        assert!(matches!(
            eval(source, json!({})),
            Err(EvaluationError::ResourceLimit(_))
        ));
        assert!(matches!(
            eval("let a = []; a[5000] = 1", json!({})),
            Err(EvaluationError::ResourceLimit(_))
        ));
    }

    #[test]
    fn converting_shared_values_is_metered() {
        let doubling = "let a = ['x']\nlet i = 0\nwhile (i < 40) { a = [a, a]; i = i + 1 }\n";
        for conversion in ["let s = '' + a", "throw a", "http.post('https://x.test/', a)", "a[a]"] {
            let mut limits = limits();
            limits.max_operations = u64::MAX;
            limits.max_value_len = 1 << 20;
            limits.deadline = Instant::now() + Duration::from_millis(20);
            let started = Instant::now();
            let result = eval_with(&format!("{doubling}{conversion}"), json!({}), &limits);
            assert!(
                matches!(
                    result,
                    Err(EvaluationError::ResourceLimit(_) | EvaluationError::Timeout)
                ),
                "{conversion}: {result:?}"
            );
            assert!(started.elapsed() < Duration::from_secs(1), "{conversion}");
        }

        // Tight limits stop it long before the deadline.
        let result = eval(&format!("{doubling}let s = '' + a"), json!({}));
        assert!(matches!(result, Err(EvaluationError::ResourceLimit(_))));
    }

    #[test]
    fn limits_value_nesting() {
        for source in [
            "let a = []\nwhile (true) { a = [a] }",
            "let o = {}\nwhile (true) { o.next = o }",
            "let a = [0]\nwhile (true) { a[0] = a }",
        ] {
            assert!(
                matches!(
                    eval(source, json!({})),
                    Err(EvaluationError::ResourceLimit(message)) if message.contains("nested")
                ),
                "{source}"
            );
        }
    }

    #[test]
    fn limits_recursion_through_nested_expressions() {
        let source = format!(
            "function f(n) {{ return {}f(n + 1){} }}\nf(0)",
            "[".repeat(100),
            "]".repeat(100)
        );
        assert!(matches!(
            eval(&source, json!({})),
            Err(EvaluationError::ResourceLimit(message)) if message.contains("nested deeper")
        ));
    }

    #[test]
    fn calls_http_capability() {
        let source = r#"
            function check(ctx, on, off, net) {
                let response = net.post("https://flags.example.com/check", {user: ctx.user})
                if (response.ok && response.body.sent.user == "ann") on() else off()
            }
        "#;
        assert_eq!(eval(source, json!({"user": "ann"})), Ok(Decision::Enabled));
        assert!(matches!(
            eval("http.get('http://down.example.com/')", json!({})),
            Err(EvaluationError::Thrown(message)) if message.contains("connection refused")
        ));
    }
}
