use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Map, Value};

use crate::config::schema::LoaderConfig;
use crate::error::Result;
use crate::script::ast::{Arg, BinaryOp, Expr, FunctionDef, Program, SchemaDef, Stmt, StmtKind, UnaryOp};
use crate::script::builtins::{
    call_pure, contains_value, is_pure_builtin, regex_match, BuiltinError, MAX_ARRAY_LEN,
    MAX_STRING_BYTES, MAX_VALUE_BYTES, MAX_VALUE_DEPTH,
};
use crate::script::value::{
    as_builtin, as_function, as_handle, as_string, as_type, function_ref, is_truthy, measure,
    number_to_value, schema_value, store_handle, to_number, tool_value, type_name,
    value_to_string, STORE_HANDLE,
};
use crate::script::ScriptError;
use crate::tools::types::{FieldKind, InputSchema, SchemaField};

/// Data-store methods scripts may call through the store handle, with
/// their parameter names.
pub const STORE_METHODS: [(&str, &[&str]); 9] = [
    ("insert_member", &["name", "email", "age"]),
    ("insert_product", &["name", "price"]),
    ("insert_record", &["member_id", "product_id", "quantity"]),
    ("get_member_by_name", &["name"]),
    ("get_product_by_name", &["name"]),
    ("get_member_records", &["member_id"]),
    ("list_all_members", &[]),
    ("list_all_products", &[]),
    ("list_all_records", &[]),
];

const STRUCTURED_TOOL_PARAMS: [&str; 5] =
    ["func", "name", "description", "args_schema", "return_direct"];

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_steps: u64,
    pub timeout: Duration,
    pub max_call_depth: usize,
}

impl Limits {
    pub fn from_config(config: &LoaderConfig) -> Self {
        Self {
            max_steps: config.max_steps,
            timeout: Duration::from_millis(config.timeout_ms),
            max_call_depth: config.max_call_depth,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractKind {
    User,
    Product,
}

/// Everything a script can reach outside its own values.
#[async_trait]
pub trait ScriptHost: Send + Sync {
    async fn call_store(&self, method: &str, args: Vec<Value>) -> Result<Value>;
    async fn extract(&self, kind: ExtractKind, text: &str) -> Result<Value>;
}

/// Global symbol table of one load. Function bodies live beside the
/// globals; a global bound to a function reference resolves through them.
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    pub globals: HashMap<String, Value>,
    pub functions: HashMap<String, Arc<FunctionDef>>,
}

impl Namespace {
    pub fn define(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_owned(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub fn function(&self, name: &str) -> Option<&Arc<FunctionDef>> {
        let reference = as_function(self.globals.get(name)?)?;
        self.functions.get(reference)
    }
}

enum Flow {
    Next,
    Return(Value),
}

type Scope = HashMap<String, Value>;

pub struct Machine {
    host: Arc<dyn ScriptHost>,
    limits: Limits,
    namespace: Namespace,
    frames: Vec<Vec<Scope>>,
    steps: u64,
    deadline: Option<Instant>,
    line: usize,
}

impl Machine {
    pub fn new(host: Arc<dyn ScriptHost>, limits: Limits, namespace: Namespace) -> Self {
        Self {
            host,
            limits,
            namespace,
            frames: vec![Vec::new()],
            steps: 0,
            deadline: Instant::now().checked_add(limits.timeout),
            line: 0,
        }
    }

    pub fn into_namespace(self) -> Namespace {
        self.namespace
    }

    /// Runs top-level statements; `let` at the top level defines globals.
    pub async fn run(&mut self, program: &Program) -> std::result::Result<(), ScriptError> {
        let timeout = self.limits.timeout;
        let outcome = tokio::time::timeout(timeout, self.exec_block(&program.statements)).await;
        match outcome {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(self.timed_out()),
        }
    }

    /// Calls a script function with arguments matched to parameters by
    /// name. Absent arguments take the parameter default, else null.
    pub async fn call_function(
        &mut self,
        name: &str,
        args: &Map<String, Value>,
    ) -> std::result::Result<Value, ScriptError> {
        let Some(def) = self.namespace.functions.get(name).cloned() else {
            return Err(self.runtime(format!("undefined function '{name}'")));
        };
        let supplied = def
            .params
            .iter()
            .map(|param| args.get(&param.name).cloned())
            .collect();

        let timeout = self.limits.timeout;
        let outcome = tokio::time::timeout(timeout, self.invoke(def, supplied, false)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(self.timed_out()),
        }
    }

    fn timed_out(&self) -> ScriptError {
        ScriptError::Budget(format!(
            "execution exceeded the time limit of {} ms",
            self.limits.timeout.as_millis()
        ))
    }

    fn runtime(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::runtime(self.line, message)
    }

    fn builtin_failed(&self, err: BuiltinError) -> ScriptError {
        match err {
            BuiltinError::Invalid(message) => self.runtime(message),
            BuiltinError::TooLarge(message) => {
                ScriptError::Budget(format!("{message} (line {})", self.line))
            }
        }
    }

    fn tick(&mut self) -> std::result::Result<(), ScriptError> {
        self.steps += 1;
        if self.steps > self.limits.max_steps {
            return Err(ScriptError::Budget(format!(
                "execution exceeded the limit of {} steps",
                self.limits.max_steps
            )));
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(self.timed_out());
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        self.frames
            .last()
            .and_then(|frame| frame.iter().rev().find_map(|scope| scope.get(name)))
            .or_else(|| self.namespace.get(name))
    }

    fn declare(&mut self, name: &str, value: Value) {
        match self.frames.last_mut().and_then(|frame| frame.last_mut()) {
            Some(scope) => {
                scope.insert(name.to_owned(), value);
            }
            None => self.namespace.define(name, value),
        }
    }

    fn assign(&mut self, name: &str, value: Value) -> std::result::Result<(), ScriptError> {
        if let Some(frame) = self.frames.last_mut() {
            if let Some(slot) = frame.iter_mut().rev().find_map(|scope| scope.get_mut(name)) {
                *slot = value;
                return Ok(());
            }
        }
        if let Some(slot) = self.namespace.globals.get_mut(name) {
            *slot = value;
            return Ok(());
        }
        Err(self.runtime(format!(
            "assignment to undeclared variable '{name}'; declare it with 'let'"
        )))
    }

    fn push_scope(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.push(Scope::new());
        }
    }

    fn pop_scope(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.pop();
        }
    }

    fn exec_block<'a>(
        &'a mut self,
        statements: &'a [Stmt],
    ) -> BoxFuture<'a, std::result::Result<Flow, ScriptError>> {
        async move {
            for statement in statements {
                if let Flow::Return(value) = self.exec_stmt(statement).await? {
                    return Ok(Flow::Return(value));
                }
            }
            Ok(Flow::Next)
        }
        .boxed()
    }

    async fn exec_scoped(&mut self, statements: &[Stmt]) -> std::result::Result<Flow, ScriptError> {
        self.push_scope();
        let flow = self.exec_block(statements).await;
        self.pop_scope();
        flow
    }

    fn exec_stmt<'a>(
        &'a mut self,
        statement: &'a Stmt,
    ) -> BoxFuture<'a, std::result::Result<Flow, ScriptError>> {
        async move {
            self.line = statement.line;
            self.tick()?;

            match &statement.kind {
                StmtKind::Let { name, value } => {
                    let value = self.eval(value).await?;
                    self.declare(name, value);
                }
                StmtKind::Assign { name, value } => {
                    let value = self.eval(value).await?;
                    self.assign(name, value)?;
                }
                StmtKind::If {
                    branches,
                    otherwise,
                } => {
                    for branch in branches {
                        let condition = self.eval(&branch.condition).await?;
                        if is_truthy(&condition) {
                            return self.exec_scoped(&branch.body).await;
                        }
                    }
                    if let Some(body) = otherwise {
                        return self.exec_scoped(body).await;
                    }
                }
                StmtKind::For {
                    item,
                    iterable,
                    body,
                } => {
                    let items = match self.eval(iterable).await? {
                        Value::Array(items) => items,
                        Value::Object(map) => map.keys().cloned().map(Value::String).collect(),
                        Value::String(text) => {
                            text.chars().map(|c| Value::String(c.to_string())).collect()
                        }
                        Value::Null => Vec::new(),
                        other => {
                            return Err(self.runtime(format!(
                                "cannot iterate over {}",
                                type_name(&other)
                            )))
                        }
                    };

                    for value in items {
                        self.push_scope();
                        self.declare(item, value);
                        let flow = self.exec_block(body).await;
                        self.pop_scope();
                        if let Flow::Return(value) = flow? {
                            return Ok(Flow::Return(value));
                        }
                    }
                }
                StmtKind::While { condition, body } => loop {
                    self.line = statement.line;
                    let condition = self.eval(condition).await?;
                    if !is_truthy(&condition) {
                        break;
                    }
                    if let Flow::Return(value) = self.exec_scoped(body).await? {
                        return Ok(Flow::Return(value));
                    }
                },
                StmtKind::Return(value) => {
                    let value = match value {
                        Some(expr) => self.eval(expr).await?,
                        None => Value::Null,
                    };
                    return Ok(Flow::Return(value));
                }
                StmtKind::Function(def) => {
                    self.namespace
                        .functions
                        .insert(def.name.clone(), Arc::clone(def));
                    self.declare(&def.name, function_ref(&def.name));
                }
                StmtKind::Schema(def) => {
                    let schema = self.build_schema(def)?;
                    self.declare(&def.name, schema_value(&schema));
                }
                StmtKind::Expr(expr) => {
                    self.eval(expr).await?;
                }
            }
            Ok(Flow::Next)
        }
        .boxed()
    }

    fn build_schema(&self, def: &SchemaDef) -> std::result::Result<InputSchema, ScriptError> {
        let mut schema = InputSchema::new(def.name.clone());
        for field in &def.fields {
            let kind = self
                .lookup(&field.type_name)
                .and_then(as_type)
                .ok_or_else(|| {
                    self.runtime(format!(
                        "unknown type '{}' for field '{}'",
                        field.type_name, field.name
                    ))
                })?;

            if let Some(default) = &field.default {
                let fits = match kind {
                    FieldKind::String => default.is_string(),
                    FieldKind::Integer => default.is_i64() || default.is_u64(),
                    FieldKind::Number => default.is_number(),
                    FieldKind::Boolean => default.is_boolean(),
                };
                if !fits {
                    return Err(self.runtime(format!(
                        "default for field '{}' is not a {}",
                        field.name,
                        kind.as_str()
                    )));
                }
            }

            schema.fields.push(SchemaField {
                name: field.name.clone(),
                kind,
                description: field.description.clone(),
                required: !field.optional && field.default.is_none(),
                default: field.default.clone(),
            });
        }
        Ok(schema)
    }

    fn eval<'a>(&'a mut self, expr: &'a Expr) -> BoxFuture<'a, std::result::Result<Value, ScriptError>> {
        async move {
            self.tick()?;

            match expr {
                Expr::Variable(name) => self
                    .lookup(name)
                    .cloned()
                    .ok_or_else(|| self.runtime(format!("undefined name '{name}'"))),
                Expr::Literal(value) => Ok(value.clone()),
                Expr::Array(items) => {
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(self.eval(item).await?);
                    }
                    self.checked(Value::Array(values))
                }
                Expr::Object(entries) => {
                    let mut map = Map::new();
                    for (key, value) in entries {
                        let value = self.eval(value).await?;
                        map.insert(key.clone(), value);
                    }
                    self.checked(Value::Object(map))
                }
                Expr::Unary { op, expr } => {
                    let value = self.eval(expr).await?;
                    match op {
                        UnaryOp::Not => Ok(Value::Bool(!is_truthy(&value))),
                        UnaryOp::Neg => to_number(&value)
                            .map(|number| number_to_value(-number))
                            .ok_or_else(|| {
                                self.runtime(format!("cannot negate non-number value: {value}"))
                            }),
                    }
                }
                Expr::Binary {
                    left,
                    op: BinaryOp::Or,
                    right,
                } => {
                    let left = self.eval(left).await?;
                    if is_truthy(&left) {
                        return Ok(Value::Bool(true));
                    }
                    let right = self.eval(right).await?;
                    Ok(Value::Bool(is_truthy(&right)))
                }
                Expr::Binary {
                    left,
                    op: BinaryOp::And,
                    right,
                } => {
                    let left = self.eval(left).await?;
                    if !is_truthy(&left) {
                        return Ok(Value::Bool(false));
                    }
                    let right = self.eval(right).await?;
                    Ok(Value::Bool(is_truthy(&right)))
                }
                Expr::Binary { left, op, right } => {
                    let left = self.eval(left).await?;
                    let right = self.eval(right).await?;
                    self.eval_binary(left, *op, right)
                }
                Expr::Access { target, segment } => {
                    let value = self.eval(target).await?;
                    Ok(get_segment(&value, segment))
                }
                Expr::Index { target, index } => {
                    let value = self.eval(target).await?;
                    let index = self.eval(index).await?;
                    Ok(match (value, index) {
                        (Value::Array(items), Value::Number(index)) => index
                            .as_u64()
                            .and_then(|idx| items.get(idx as usize).cloned())
                            .unwrap_or(Value::Null),
                        (Value::Object(map), Value::String(key)) => {
                            map.get(&key).cloned().unwrap_or(Value::Null)
                        }
                        _ => Value::Null,
                    })
                }
                Expr::Call { callee, args } => self.call_named(callee, args).await,
                Expr::MethodCall {
                    target,
                    method,
                    args,
                } => {
                    let receiver = self.eval(target).await?;
                    self.call_method(receiver, method, args).await
                }
            }
        }
        .boxed()
    }

    fn eval_binary(
        &self,
        left: Value,
        op: BinaryOp,
        right: Value,
    ) -> std::result::Result<Value, ScriptError> {
        match op {
            BinaryOp::Or => Ok(Value::Bool(is_truthy(&left) || is_truthy(&right))),
            BinaryOp::And => Ok(Value::Bool(is_truthy(&left) && is_truthy(&right))),
            BinaryOp::Eq => Ok(Value::Bool(values_equal(&left, &right))),
            BinaryOp::Neq => Ok(Value::Bool(!values_equal(&left, &right))),
            BinaryOp::Gt | BinaryOp::Gte | BinaryOp::Lt | BinaryOp::Lte => {
                compare_values(&left, &right, op).map_err(|message| self.runtime(message))
            }
            BinaryOp::Contains => Ok(Value::Bool(contains_value(&left, &right))),
            BinaryOp::Matches => regex_match(&left, &right)
                .map(Value::Bool)
                .map_err(|message| self.runtime(message)),
            BinaryOp::Add => {
                if let (Value::Array(a), Value::Array(b)) = (&left, &right) {
                    let joined = Value::Array(a.iter().chain(b).cloned().collect());
                    return self.checked(joined);
                }
                if let (Some(a), Some(b)) = (numeric(&left), numeric(&right)) {
                    return Ok(number_to_value(a + b));
                }
                self.checked(Value::String(format!(
                    "{}{}",
                    value_to_string(&left),
                    value_to_string(&right)
                )))
            }
            BinaryOp::Sub => {
                let (a, b) = self.numbers_pair(&left, &right, "-")?;
                Ok(number_to_value(a - b))
            }
            BinaryOp::Mul => {
                let (a, b) = self.numbers_pair(&left, &right, "*")?;
                Ok(number_to_value(a * b))
            }
            BinaryOp::Div => {
                let (a, b) = self.numbers_pair(&left, &right, "/")?;
                if b == 0.0 {
                    return Err(self.runtime("division by zero"));
                }
                Ok(number_to_value(a / b))
            }
        }
    }

    fn numbers_pair(
        &self,
        left: &Value,
        right: &Value,
        op: &str,
    ) -> std::result::Result<(f64, f64), ScriptError> {
        let a = to_number(left).ok_or_else(|| {
            self.runtime(format!(
                "left operand for '{op}' must be a number, got {}",
                value_to_string(left)
            ))
        })?;
        let b = to_number(right).ok_or_else(|| {
            self.runtime(format!(
                "right operand for '{op}' must be a number, got {}",
                value_to_string(right)
            ))
        })?;
        Ok((a, b))
    }

    fn checked(&self, value: Value) -> std::result::Result<Value, ScriptError> {
        let too_large = match &value {
            Value::String(text) => text.len() > MAX_STRING_BYTES,
            Value::Array(items) if items.len() > MAX_ARRAY_LEN => true,
            Value::Array(_) | Value::Object(_) => {
                let (bytes, depth) = measure(&value);
                bytes > MAX_VALUE_BYTES || depth > MAX_VALUE_DEPTH
            }
            _ => false,
        };
        if too_large {
            return Err(ScriptError::Budget(format!(
                "value produced at line {} exceeds the size limit",
                self.line
            )));
        }
        Ok(value)
    }

    async fn eval_args(
        &mut self,
        args: &[Arg],
    ) -> std::result::Result<Vec<(Option<String>, Value)>, ScriptError> {
        let mut evaluated = Vec::with_capacity(args.len());
        for arg in args {
            let value = self.eval(&arg.value).await?;
            evaluated.push((arg.name.clone(), value));
        }
        Ok(evaluated)
    }

    async fn call_named(
        &mut self,
        callee: &str,
        args: &[Arg],
    ) -> std::result::Result<Value, ScriptError> {
        let Some(target) = self.lookup(callee).cloned() else {
            return Err(self.runtime(format!("undefined function '{callee}'")));
        };

        if let Some(function) = as_function(&target) {
            let Some(def) = self.namespace.functions.get(function).cloned() else {
                return Err(self.runtime(format!("undefined function '{function}'")));
            };
            let evaluated = self.eval_args(args).await?;
            let supplied = {
                let params: Vec<&str> = def.params.iter().map(|param| param.name.as_str()).collect();
                bind(&def.name, &params, evaluated)
            }
            .map_err(|message| self.runtime(message))?;
            return self.invoke(def, supplied, true).await;
        }

        if let Some(builtin) = as_builtin(&target) {
            if builtin == "structured_tool" {
                return self.structured_tool(args).await;
            }
            let evaluated = self.eval_args(args).await?;
            return self.call_builtin(builtin, evaluated).await;
        }

        Err(self.runtime(format!(
            "'{callee}' is a {} and cannot be called",
            type_name(&target)
        )))
    }

    fn invoke(
        &mut self,
        def: Arc<FunctionDef>,
        supplied: Vec<Option<Value>>,
        strict: bool,
    ) -> BoxFuture<'_, std::result::Result<Value, ScriptError>> {
        async move {
            if self.frames.len() > self.limits.max_call_depth {
                return Err(ScriptError::Budget(format!(
                    "call depth limit of {} exceeded in '{}'",
                    self.limits.max_call_depth, def.name
                )));
            }

            let caller_line = self.line;
            self.frames.push(vec![Scope::new()]);
            let result = self.run_body(&def, supplied, strict).await;
            self.frames.pop();
            self.line = caller_line;
            result
        }
        .boxed()
    }

    async fn run_body(
        &mut self,
        def: &FunctionDef,
        supplied: Vec<Option<Value>>,
        strict: bool,
    ) -> std::result::Result<Value, ScriptError> {
        for (param, value) in def.params.iter().zip(supplied) {
            let value = match (value, &param.default) {
                (Some(value), _) => value,
                (None, Some(default)) => self.eval(default).await?,
                (None, None) if strict => {
                    return Err(self.runtime(format!(
                        "missing argument '{}' for '{}'",
                        param.name, def.name
                    )))
                }
                (None, None) => Value::Null,
            };
            self.declare(&param.name, value);
        }

        match self.exec_block(&def.body).await? {
            Flow::Return(value) => Ok(value),
            Flow::Next => Ok(Value::Null),
        }
    }

    async fn call_builtin(
        &mut self,
        name: &str,
        args: Vec<(Option<String>, Value)>,
    ) -> std::result::Result<Value, ScriptError> {
        match name {
            "data_store" => {
                bind(name, &[], args).map_err(|message| self.runtime(message))?;
                Ok(store_handle())
            }
            "extract_user" | "extract_product" => {
                let kind = if name == "extract_user" {
                    ExtractKind::User
                } else {
                    ExtractKind::Product
                };
                let mut supplied =
                    bind(name, &["text"], args).map_err(|message| self.runtime(message))?;
                let text = supplied
                    .pop()
                    .flatten()
                    .as_ref()
                    .and_then(as_string)
                    .unwrap_or_default();
                self.host
                    .extract(kind, &text)
                    .await
                    .map_err(|err| self.runtime(format!("{name} failed: {err}")))
            }
            _ if is_pure_builtin(name) => {
                let positional = positional_only(name, args).map_err(|message| self.runtime(message))?;
                let value = call_pure(name, &positional).map_err(|err| self.builtin_failed(err))?;
                self.checked(value)
            }
            _ => Err(self.runtime(format!("unknown function '{name}'"))),
        }
    }

    async fn call_method(
        &mut self,
        receiver: Value,
        method: &str,
        args: &[Arg],
    ) -> std::result::Result<Value, ScriptError> {
        if as_handle(&receiver) == Some(STORE_HANDLE) {
            let Some((_, params)) = STORE_METHODS.iter().find(|(name, _)| *name == method) else {
                return Err(self.runtime(format!("data store has no method '{method}'")));
            };
            let evaluated = self.eval_args(args).await?;
            let supplied = bind(method, params, evaluated).map_err(|message| self.runtime(message))?;
            let values = supplied
                .into_iter()
                .map(|value| value.unwrap_or(Value::Null))
                .collect();
            tracing::debug!(method, "script store call");
            return self
                .host
                .call_store(method, values)
                .await
                .map_err(|err| self.runtime(format!("db.{method} failed: {err}")));
        }

        if is_pure_builtin(method) {
            let evaluated = self.eval_args(args).await?;
            let mut positional =
                positional_only(method, evaluated).map_err(|message| self.runtime(message))?;
            positional.insert(0, receiver);
            let value = call_pure(method, &positional).map_err(|err| self.builtin_failed(err))?;
            return self.checked(value);
        }

        Err(self.runtime(format!(
            "{} has no method '{method}'",
            type_name(&receiver)
        )))
    }

    /// `func` and `args_schema` are taken as names, not evaluated, so a
    /// missing definition surfaces when the loader resolves them.
    async fn structured_tool(&mut self, args: &[Arg]) -> std::result::Result<Value, ScriptError> {
        let mut definition = Map::new();
        for arg in args {
            let Some(key) = arg.name.as_deref() else {
                return Err(self.runtime("structured_tool accepts keyword arguments only"));
            };
            if !STRUCTURED_TOOL_PARAMS.contains(&key) {
                return Err(self.runtime(format!(
                    "structured_tool got an unexpected keyword argument '{key}'"
                )));
            }

            let value = if matches!(key, "func" | "args_schema") {
                match &arg.value {
                    Expr::Variable(symbol) => json!(symbol),
                    _ => return Err(self.runtime(format!("'{key}' must be a name"))),
                }
            } else {
                self.eval(&arg.value).await?
            };
            definition.insert(key.to_owned(), value);
        }
        Ok(tool_value(Value::Object(definition)))
    }
}

fn bind(
    callable: &str,
    params: &[&str],
    args: Vec<(Option<String>, Value)>,
) -> std::result::Result<Vec<Option<Value>>, String> {
    let mut slots: Vec<Option<Value>> = vec![None; params.len()];
    let mut next = 0;
    for (name, value) in args {
        let index = match name {
            None => {
                if next >= params.len() {
                    return Err(format!(
                        "'{callable}' takes at most {} argument(s)",
                        params.len()
                    ));
                }
                next += 1;
                next - 1
            }
            Some(key) => params
                .iter()
                .position(|param| *param == key)
                .ok_or_else(|| format!("'{callable}' got an unexpected keyword argument '{key}'"))?,
        };
        if slots[index].is_some() {
            return Err(format!(
                "'{callable}' got multiple values for argument '{}'",
                params[index]
            ));
        }
        slots[index] = Some(value);
    }
    Ok(slots)
}

fn positional_only(
    callable: &str,
    args: Vec<(Option<String>, Value)>,
) -> std::result::Result<Vec<Value>, String> {
    args.into_iter()
        .map(|(name, value)| match name {
            None => Ok(value),
            Some(key) => Err(format!(
                "'{callable}' does not accept keyword argument '{key}'"
            )),
        })
        .collect()
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::Bool(_) => to_number(value),
        _ => None,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn get_segment(value: &Value, segment: &str) -> Value {
    match value {
        Value::Object(map) => map.get(segment).cloned().unwrap_or(Value::Null),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get(index).cloned())
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn compare_values(left: &Value, right: &Value, op: BinaryOp) -> std::result::Result<Value, String> {
    let ordering = if let (Some(a), Some(b)) = (to_number(left), to_number(right)) {
        a.partial_cmp(&b)
    } else if let (Some(a), Some(b)) = (as_string(left), as_string(right)) {
        Some(a.cmp(&b))
    } else {
        None
    };

    let Some(ordering) = ordering else {
        return Err(format!(
            "cannot compare '{}' and '{}'",
            value_to_string(left),
            value_to_string(right)
        ));
    };

    Ok(Value::Bool(match op {
        BinaryOp::Gt => ordering.is_gt(),
        BinaryOp::Gte => ordering.is_ge(),
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Lte => ordering.is_le(),
        _ => false,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::script::parser::parse_program;
    use crate::script::value::builtin_ref;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeHost {
        calls: Mutex<Vec<(String, Vec<Value>)>>,
    }

    #[async_trait]
    impl ScriptHost for FakeHost {
        async fn call_store(&self, method: &str, args: Vec<Value>) -> Result<Value> {
            self.calls
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push((method.to_owned(), args));
            match method {
                "get_member_by_name" => Ok(json!({"id": 1, "name": "Alice Johnson"})),
                "list_all_products" => Ok(json!([{"id": 1, "name": "Laptop", "price": 999.99}])),
                "insert_product" => Ok(json!(4)),
                _ => Err(Error::Storage("not available".to_owned())),
            }
        }

        async fn extract(&self, kind: ExtractKind, text: &str) -> Result<Value> {
            Ok(match kind {
                ExtractKind::User => json!({"name": text, "email": null, "age": null}),
                ExtractKind::Product => json!({"name": text, "price": 10.0, "quantity": 1}),
            })
        }
    }

    fn namespace() -> Namespace {
        let mut namespace = Namespace::default();
        for name in crate::script::builtins::HOST_BUILTINS
            .iter()
            .chain(crate::script::builtins::PURE_BUILTINS.iter())
        {
            namespace.define(name, builtin_ref(name));
        }
        for kind in [FieldKind::String, FieldKind::Integer, FieldKind::Number, FieldKind::Boolean] {
            namespace.define(kind.as_str(), crate::script::value::type_ref(kind));
        }
        namespace
    }

    fn limits() -> Limits {
        Limits {
            max_steps: 10_000,
            timeout: Duration::from_secs(5),
            max_call_depth: 16,
        }
    }

    async fn run(source: &str) -> (std::result::Result<(), ScriptError>, Namespace, Arc<FakeHost>) {
        let host = Arc::new(FakeHost::default());
        let program = parse_program(source).expect("parse");
        let mut machine = Machine::new(host.clone(), limits(), namespace());
        let result = machine.run(&program).await;
        (result, machine.into_namespace(), host)
    }

    #[tokio::test]
    async fn top_level_let_defines_globals() {
        let (result, namespace, _) = run("let total = 2 + 3 * 4\nlet label = \"n=\" + total").await;
        result.expect("run");
        assert_eq!(namespace.get("total"), Some(&json!(14)));
        assert_eq!(namespace.get("label"), Some(&json!("n=14")));
    }

    #[tokio::test]
    async fn functions_recurse_and_loop() {
        let source = r#"
            fn fact(n) {
                if n <= 1 { return 1 }
                return n * fact(n - 1)
            }
            fn total(items) {
                let sum = 0
                for item in items { sum = sum + item }
                return sum
            }
            let a = fact(5)
            let b = total([1, 2, 3])
        "#;
        let (result, namespace, _) = run(source).await;
        result.expect("run");
        assert_eq!(namespace.get("a"), Some(&json!(120)));
        assert_eq!(namespace.get("b"), Some(&json!(6)));
    }

    #[tokio::test]
    async fn store_methods_go_through_host() {
        let source = "let db = data_store()\nlet id = db.insert_product(name = \"Tablet\", price = 299.5)";
        let (result, namespace, host) = run(source).await;
        result.expect("run");

        assert_eq!(namespace.get("id"), Some(&json!(4)));
        let calls = host.calls.lock().expect("calls");
        assert_eq!(calls[0], ("insert_product".to_owned(), vec![json!("Tablet"), json!(299.5)]));
    }

    #[tokio::test]
    async fn store_errors_become_runtime_errors_with_line() {
        let (result, _, _) = run("let db = data_store()\n\ndb.list_all_records()").await;
        let err = result.expect_err("store failure");
        assert!(matches!(err, ScriptError::Runtime { line: 3, .. }), "{err:?}");
    }

    #[tokio::test]
    async fn methods_fall_back_to_builtins() {
        let (result, namespace, _) = run("let s = \"  Laptop \".trim().upper()").await;
        result.expect("run");
        assert_eq!(namespace.get("s"), Some(&json!("LAPTOP")));
    }

    #[tokio::test]
    async fn infinite_loop_exhausts_step_budget() {
        let (result, _, _) = run("while true { }").await;
        assert!(matches!(result, Err(ScriptError::Budget(_))));
    }

    #[tokio::test]
    async fn unbounded_recursion_hits_depth_limit() {
        let (result, _, _) = run("fn f(n) { return f(n + 1) }\nf(0)").await;
        let Err(ScriptError::Budget(message)) = result else {
            panic!("expected budget error");
        };
        assert!(message.contains("call depth"));
    }

    #[tokio::test]
    async fn undeclared_assignment_is_rejected() {
        let (result, _, _) = run("fn f() { missing = 1 }\nf()").await;
        assert!(matches!(result, Err(ScriptError::Runtime { line: 1, .. })));
    }

    #[tokio::test]
    async fn function_called_by_name_with_json_arguments() {
        let source = "fn describe(text, prefix = \"Member\") {\n  let db = data_store()\n  let member = db.get_member_by_name(text)\n  return prefix + \" \" + member.name + \" has ID \" + member.id\n}";
        let host = Arc::new(FakeHost::default());
        let program = parse_program(source).expect("parse");
        let mut machine = Machine::new(host, limits(), namespace());
        machine.run(&program).await.expect("run");

        let args = json!({"text": "Alice Johnson"});
        let value = machine
            .call_function("describe", args.as_object().expect("object"))
            .await
            .expect("call");
        assert_eq!(value, json!("Member Alice Johnson has ID 1"));
    }

    #[tokio::test]
    async fn structured_tool_keeps_symbol_names() {
        let (result, namespace, _) =
            run("let t = structured_tool(func = missing_fn, name = \"T\", description = \"d\", args_schema = Missing)").await;
        result.expect("run");
        assert_eq!(
            namespace.get("t"),
            Some(&json!({"$tool": {"func": "missing_fn", "name": "T", "description": "d", "args_schema": "Missing"}}))
        );
    }

    #[tokio::test]
    async fn schema_declaration_uses_preloaded_types() {
        let (result, namespace, _) =
            run("schema Input { text: string \"The text\", limit: integer? = 5 }").await;
        result.expect("run");
        let schema = crate::script::value::as_schema(namespace.get("Input").expect("schema"))
            .expect("decodes");
        assert_eq!(schema.fields[0].kind, FieldKind::String);
        assert!(schema.fields[0].required);
        assert!(!schema.fields[1].required);

        let (result, _, _) = run("schema Bad { text: text }").await;
        assert!(matches!(result, Err(ScriptError::Runtime { .. })));
    }

    #[tokio::test]
    async fn quadratic_replace_is_stopped_by_the_size_budget() {
        let source = r#"
            let s = "a"
            let i = 0
            while i < 19 { s = s + s; i = i + 1 }
            let n = replace(s, "a", s).length()
        "#;
        let (result, namespace, _) = run(source).await;
        let Err(ScriptError::Budget(message)) = result else {
            panic!("expected budget error, got {result:?}");
        };
        assert!(message.contains("'replace' would produce"), "{message}");
        assert_eq!(namespace.get("n"), None);
    }

    #[tokio::test]
    async fn growing_arrays_hit_the_footprint_limit() {
        let source = r#"
            let s = "a"
            let i = 0
            while i < 19 { s = s + s; i = i + 1 }
            let items = []
            while true { items = items.push(s) }
        "#;
        let (result, _, _) = run(source).await;
        let Err(ScriptError::Budget(message)) = result else {
            panic!("expected budget error, got {result:?}");
        };
        assert!(message.contains("'push' would produce"), "{message}");

        let (result, _, _) = run("let v = []\nwhile true { v = [v] }").await;
        let Err(ScriptError::Budget(message)) = result else {
            panic!("expected budget error, got {result:?}");
        };
        assert!(message.contains("size limit"), "{message}");
    }

    #[tokio::test]
    async fn huge_timeout_does_not_overflow_the_deadline() {
        let host = Arc::new(FakeHost::default());
        let limits = Limits {
            timeout: Duration::MAX,
            ..limits()
        };
        let program = parse_program("let x = 1 + 1").expect("parse");
        let mut machine = Machine::new(host, limits, namespace());
        machine.run(&program).await.expect("run");
        assert_eq!(machine.into_namespace().get("x"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn numbers_compare_across_representations() {
        let (result, namespace, _) = run("let same = 999.0 == 999\nlet bigger = \"10\" > 9").await;
        result.expect("run");
        assert_eq!(namespace.get("same"), Some(&json!(true)));
        assert_eq!(namespace.get("bigger"), Some(&json!(true)));
    }
}
