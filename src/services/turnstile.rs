use base64::{engine::general_purpose, Engine as _};
use rand::Rng;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Instant;
use tracing::{debug, warn};

/// Turnstile 求解协作者
pub trait TurnstileSolver: Send + Sync {
    fn solve(&self, dx: &str, p: &str) -> String;
}

/// 默认实现，直接返回空 token
pub struct DisabledTurnstile;

impl TurnstileSolver for DisabledTurnstile {
    fn solve(&self, _dx: &str, _p: &str) -> String {
        String::new()
    }
}

/// 基于指令解释器的实现
pub struct TurnstileVm {
    started: Instant,
}

impl TurnstileVm {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for TurnstileVm {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnstileSolver for TurnstileVm {
    fn solve(&self, dx: &str, p: &str) -> String {
        let decoded = match general_purpose::STANDARD.decode(dx) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                warn!("turnstile dx 解码失败: {}", e);
                return String::new();
            }
        };

        let program = match serde_json::from_str::<Value>(&xor_str(&decoded, p)) {
            Ok(program) => VmValue::from_json(&program),
            Err(e) => {
                warn!("turnstile 指令解析失败: {}", e);
                return String::new();
            }
        };

        let mut machine = Machine::new(p, program, self.started);
        machine.run();
        machine.result.unwrap_or_default()
    }
}

/// 按字符循环异或
pub fn xor_str(input: &str, key: &str) -> String {
    let key: Vec<char> = key.chars().collect();
    if key.is_empty() {
        return input.to_string();
    }
    input
        .chars()
        .zip(key.iter().cycle())
        .map(|(a, b)| char::from_u32(a as u32 ^ *b as u32).unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

const LOCAL_STORAGE_KEYS: [&str; 7] = [
    "STATSIG_LOCAL_STORAGE_INTERNAL_STORE_V4",
    "STATSIG_LOCAL_STORAGE_STABLE_ID",
    "client-correlated-secret",
    "oai/apps/capExpiresAt",
    "oai-did",
    "STATSIG_LOCAL_STORAGE_LOGGING_REQUEST",
    "UiState.isNavigationCollapsed.1",
];

const MAX_STEPS: usize = 100_000;

type SharedMap = Rc<RefCell<Vec<(String, VmValue)>>>;

#[derive(Debug, Clone, PartialEq)]
pub enum VmValue {
    Undefined,
    Number(f64),
    Text(String),
    List(Vec<VmValue>),
    Function(Op),
    /// 保持插入顺序，按引用共享
    Map(SharedMap),
}

impl VmValue {
    fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => VmValue::Undefined,
            Value::Bool(b) => VmValue::Number(if *b { 1.0 } else { 0.0 }),
            Value::Number(n) => VmValue::Number(n.as_f64().unwrap_or_default()),
            Value::String(s) => VmValue::Text(s.clone()),
            Value::Array(items) => VmValue::List(items.iter().map(Self::from_json).collect()),
            Value::Object(map) => VmValue::Map(Rc::new(RefCell::new(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ))),
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            VmValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            VmValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// JS 字符串化
    fn to_js_string(&self) -> String {
        match self {
            VmValue::Undefined => "undefined".to_string(),
            VmValue::Number(n) => format_number(*n),
            VmValue::Text(s) => match s.as_str() {
                "window.Math" => "[object Math]".to_string(),
                "window.Reflect" => "[object Reflect]".to_string(),
                "window.performance" => "[object Performance]".to_string(),
                "window.localStorage" => "[object Storage]".to_string(),
                "window.Object" => "function Object() { [native code] }".to_string(),
                "window.Reflect.set" => "function set() { [native code] }".to_string(),
                "window.performance.now" => "function () { [native code] }".to_string(),
                "window.Object.create" => "function create() { [native code] }".to_string(),
                "window.Object.keys" => "function keys() { [native code] }".to_string(),
                "window.Math.random" => "function random() { [native code] }".to_string(),
                other => other.to_string(),
            },
            VmValue::List(items) => items
                .iter()
                .map(VmValue::to_js_string)
                .collect::<Vec<_>>()
                .join(","),
            VmValue::Function(_) => "function () { [native code] }".to_string(),
            VmValue::Map(_) => "[object Object]".to_string(),
        }
    }

    fn to_json(&self) -> String {
        match self {
            VmValue::Undefined | VmValue::Function(_) => "null".to_string(),
            VmValue::Number(n) => format_number(*n),
            VmValue::Text(s) => serde_json::to_string(s).unwrap_or_default(),
            VmValue::List(items) => format!(
                "[{}]",
                items.iter().map(VmValue::to_json).collect::<Vec<_>>().join(",")
            ),
            VmValue::Map(map) => format!(
                "{{{}}}",
                map.borrow()
                    .iter()
                    .map(|(k, v)| format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        v.to_json()
                    ))
                    .collect::<Vec<_>>()
                    .join(",")
            ),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else {
        format!("{}", n)
    }
}

/// 指令编号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Result,
    Xor,
    Assign,
    Append,
    JoinLocation,
    Call,
    Copy,
    JsonDecode,
    JsonEncode,
    Invoke,
    Base64Decode,
    Base64Encode,
    CallIfEqual,
    Noop,
    CallIfDefined,
    Join,
}

impl Op {
    const TABLE: [(u32, Op); 15] = [
        (1, Op::Xor),
        (2, Op::Assign),
        (5, Op::Append),
        (6, Op::JoinLocation),
        (7, Op::Call),
        (8, Op::Copy),
        (14, Op::JsonDecode),
        (15, Op::JsonEncode),
        (17, Op::Invoke),
        (18, Op::Base64Decode),
        (19, Op::Base64Encode),
        (20, Op::CallIfEqual),
        (21, Op::Noop),
        (23, Op::CallIfDefined),
        (24, Op::Join),
    ];
}

const RESULT_REGISTER: f64 = 3.0;
const QUEUE_REGISTER: f64 = 9.0;
const WINDOW_REGISTER: f64 = 10.0;
const KEY_REGISTER: f64 = 16.0;

struct Machine {
    registers: HashMap<u64, VmValue>,
    result: Option<String>,
    started: Instant,
}

impl Machine {
    fn new(p: &str, program: VmValue, started: Instant) -> Self {
        let mut machine = Self {
            registers: HashMap::new(),
            result: None,
            started,
        };
        for (id, op) in Op::TABLE {
            machine.set(id as f64, VmValue::Function(op));
        }
        machine.set(RESULT_REGISTER, VmValue::Function(Op::Result));
        machine.set(WINDOW_REGISTER, VmValue::Text("window".to_string()));
        machine.set(KEY_REGISTER, VmValue::Text(p.to_string()));
        let program = match program {
            VmValue::List(items) => items,
            _ => Vec::new(),
        };
        machine.set(QUEUE_REGISTER, VmValue::List(program));
        machine
    }

    fn get(&self, key: f64) -> VmValue {
        self.registers
            .get(&key.to_bits())
            .cloned()
            .unwrap_or(VmValue::Undefined)
    }

    fn set(&mut self, key: f64, value: VmValue) {
        self.registers.insert(key.to_bits(), value);
    }

    fn get_arg(&self, args: &[VmValue], index: usize) -> VmValue {
        args.get(index)
            .and_then(VmValue::as_number)
            .map(|key| self.get(key))
            .unwrap_or(VmValue::Undefined)
    }

    fn next_instruction(&mut self) -> Option<Vec<VmValue>> {
        match self.registers.get_mut(&QUEUE_REGISTER.to_bits()) {
            Some(VmValue::List(queue)) if !queue.is_empty() => {
                let mut queue: VecDeque<VmValue> = std::mem::take(queue).into();
                let instruction = queue.pop_front();
                self.set(QUEUE_REGISTER, VmValue::List(queue.into()));
                match instruction {
                    Some(VmValue::List(items)) => Some(items),
                    _ => Some(Vec::new()),
                }
            }
            _ => None,
        }
    }

    fn run(&mut self) {
        for _ in 0..MAX_STEPS {
            let Some(instruction) = self.next_instruction() else {
                return;
            };
            let Some(register) = instruction.first().and_then(VmValue::as_number) else {
                continue;
            };
            match self.get(register) {
                VmValue::Function(op) => {
                    self.call(op, instruction[1..].to_vec());
                }
                other => debug!("turnstile 寄存器 {} 不是函数: {:?}", register, other),
            }
        }
        warn!("turnstile 指令超过步数上限");
    }

    fn call(&mut self, op: Op, args: Vec<VmValue>) -> VmValue {
        let key = |index: usize| args.get(index).and_then(VmValue::as_number);

        match op {
            Op::Result => {
                let text = args.first().map(VmValue::to_js_string).unwrap_or_default();
                self.result = Some(general_purpose::STANDARD.encode(text));
            }
            Op::Xor => {
                if let (Some(e), Some(t)) = (key(0), key(1)) {
                    let value = xor_str(&self.get(e).to_js_string(), &self.get(t).to_js_string());
                    self.set(e, VmValue::Text(value));
                }
            }
            Op::Assign => {
                if let Some(e) = key(0) {
                    self.set(e, args.get(1).cloned().unwrap_or(VmValue::Undefined));
                }
            }
            Op::Append => {
                if let (Some(e), Some(t)) = (key(0), key(1)) {
                    let current = self.get(e);
                    let addend = self.get(t);
                    let value = match (current, addend) {
                        (VmValue::List(mut items), addend) => {
                            items.push(addend);
                            VmValue::List(items)
                        }
                        (a @ VmValue::Text(_), b) | (a, b @ VmValue::Text(_)) => {
                            VmValue::Text(a.to_js_string() + &b.to_js_string())
                        }
                        (VmValue::Number(a), VmValue::Number(b)) => VmValue::Number(a + b),
                        _ => VmValue::Text("NaN".to_string()),
                    };
                    self.set(e, value);
                }
            }
            Op::JoinLocation | Op::Join => {
                if let (Some(e), Some(t), Some(n)) = (key(0), key(1), key(2)) {
                    match (self.get(t), self.get(n)) {
                        (VmValue::Text(a), VmValue::Text(b)) => {
                            let joined = format!("{}.{}", a, b);
                            let value = if op == Op::JoinLocation
                                && joined == "window.document.location"
                            {
                                "https://chatgpt.com/".to_string()
                            } else {
                                joined
                            };
                            self.set(e, VmValue::Text(value));
                        }
                        _ => debug!("turnstile join 参数不是字符串"),
                    }
                }
            }
            Op::Call => {
                if let Some(e) = key(0) {
                    let values: Vec<VmValue> =
                        (1..args.len()).map(|i| self.get_arg(&args, i)).collect();
                    match self.get(e) {
                        VmValue::Text(name) if name == "window.Reflect.set" => {
                            if let Some(VmValue::Map(map)) = values.first() {
                                let field = values
                                    .get(1)
                                    .map(VmValue::to_js_string)
                                    .unwrap_or_default();
                                let value = values.get(2).cloned().unwrap_or(VmValue::Undefined);
                                let mut entries = map.borrow_mut();
                                match entries.iter_mut().find(|(k, _)| *k == field) {
                                    Some(entry) => entry.1 = value,
                                    None => entries.push((field, value)),
                                }
                            }
                        }
                        VmValue::Function(inner) => {
                            self.call(inner, values);
                        }
                        _ => {}
                    }
                }
            }
            Op::Invoke => {
                if let (Some(e), Some(t)) = (key(0), key(1)) {
                    let values: Vec<VmValue> =
                        (2..args.len()).map(|i| self.get_arg(&args, i)).collect();
                    let value = match self.get(t) {
                        VmValue::Text(name) => self.invoke_builtin(&name, &values),
                        VmValue::Function(inner) => self.call(inner, values),
                        _ => VmValue::Undefined,
                    };
                    self.set(e, value);
                }
            }
            Op::Copy => {
                if let (Some(e), Some(t)) = (key(0), key(1)) {
                    let value = self.get(t);
                    self.set(e, value);
                }
            }
            Op::JsonDecode => {
                if let (Some(e), Some(t)) = (key(0), key(1)) {
                    let value = match self.get(t).as_text().map(serde_json::from_str::<Value>) {
                        Some(Ok(json)) => VmValue::from_json(&json),
                        _ => VmValue::List(Vec::new()),
                    };
                    self.set(e, value);
                }
            }
            Op::JsonEncode => {
                if let (Some(e), Some(t)) = (key(0), key(1)) {
                    let value = self.get(t).to_json();
                    self.set(e, VmValue::Text(value));
                }
            }
            Op::Base64Decode => {
                if let Some(e) = key(0) {
                    let decoded = general_purpose::STANDARD
                        .decode(self.get(e).to_js_string())
                        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                        .unwrap_or_default();
                    self.set(e, VmValue::Text(decoded));
                }
            }
            Op::Base64Encode => {
                if let Some(e) = key(0) {
                    let encoded = general_purpose::STANDARD.encode(self.get(e).to_js_string());
                    self.set(e, VmValue::Text(encoded));
                }
            }
            Op::CallIfEqual => {
                if let (Some(e), Some(t), Some(n)) = (key(0), key(1), key(2)) {
                    if self.get(e) == self.get(t) {
                        let values: Vec<VmValue> =
                            (3..args.len()).map(|i| self.get_arg(&args, i)).collect();
                        if let VmValue::Function(inner) = self.get(n) {
                            self.call(inner, values);
                        }
                    }
                }
            }
            Op::Noop => {}
            Op::CallIfDefined => {
                if let (Some(e), Some(t)) = (key(0), key(1)) {
                    if self.get(e) != VmValue::Undefined {
                        if let VmValue::Function(inner) = self.get(t) {
                            self.call(inner, args[2..].to_vec());
                        }
                    }
                }
            }
        }
        VmValue::Undefined
    }

    /// 模拟浏览器原生函数
    fn invoke_builtin(&self, name: &str, args: &[VmValue]) -> VmValue {
        match name {
            "window.performance.now" => VmValue::Number(
                self.started.elapsed().as_nanos() as f64 / 1e6 + rand::thread_rng().gen::<f64>() / 1e6,
            ),
            "window.Object.create" => VmValue::Map(Rc::new(RefCell::new(Vec::new()))),
            "window.Object.keys" => match args.first().and_then(VmValue::as_text) {
                Some("window.localStorage") => VmValue::List(
                    LOCAL_STORAGE_KEYS
                        .iter()
                        .map(|k| VmValue::Text(k.to_string()))
                        .collect(),
                ),
                _ => VmValue::Undefined,
            },
            "window.Math.random" => VmValue::Number(rand::thread_rng().gen()),
            _ => VmValue::Undefined,
        }
    }
}
