use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// 日志配置
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LevelFilter,
    pub show_timestamp: bool,
    /// 是否显示模块路径
    pub show_module: bool,
    /// 是否使用颜色输出（仅终端）
    pub use_color: bool,
    pub output: LogOutput,
}

/// 日志输出目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    File(PathBuf),
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            show_timestamp: true,
            show_module: false,
            use_color: true,
            output: LogOutput::Stdout,
        }
    }
}

impl LogConfig {
    pub fn new(level: LevelFilter) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// 按命令行参数构建：`--verbose` 打开 DEBUG，`--output` 改为写文件
    pub fn from_cli(verbose: bool, output: Option<&str>) -> Self {
        let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
        let config = Self::new(level).with_module(verbose);
        match output.map(str::trim).filter(|p| !p.is_empty()) {
            Some(path) => config.with_file(path),
            None => config,
        }
    }

    pub fn with_timestamp(mut self, show: bool) -> Self {
        self.show_timestamp = show;
        self
    }

    pub fn with_module(mut self, show: bool) -> Self {
        self.show_module = show;
        self
    }

    pub fn with_color(mut self, use_color: bool) -> Self {
        self.use_color = use_color;
        self
    }

    /// 设置输出到文件
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.output = LogOutput::File(path.as_ref().to_path_buf());
        self
    }

    fn file_path(&self) -> Option<&Path> {
        match &self.output {
            LogOutput::File(path) => Some(path),
            LogOutput::Stdout => None,
        }
    }

    fn to_stdout(&self) -> bool {
        self.output == LogOutput::Stdout
    }
}

/// 自定义日志器
struct CustomLogger {
    config: LogConfig,
    file: Option<Mutex<File>>,
}

/// 以追加方式打开日志文件，必要时创建目录
fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

impl Log for CustomLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.config.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if self.config.to_stdout() {
            println!("{}", self.format_log(record, self.config.use_color));
        }

        // 文件中不使用颜色
        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                let _ = writeln!(f, "{}", self.format_log(record, false));
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                let _ = f.flush();
            }
        }
    }
}

impl CustomLogger {
    fn format_log(&self, record: &Record, use_color: bool) -> String {
        let timestamp = if self.config.show_timestamp {
            format!("[{}] ", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
        } else {
            String::new()
        };

        let level = if use_color {
            match record.level() {
                Level::Error => "\x1b[31mERROR\x1b[0m", // 红色
                Level::Warn => "\x1b[33mWARN \x1b[0m",  // 黄色
                Level::Info => "\x1b[32mINFO \x1b[0m",  // 绿色
                Level::Debug => "\x1b[36mDEBUG\x1b[0m", // 青色
                Level::Trace => "\x1b[35mTRACE\x1b[0m", // 紫色
            }
        } else {
            match record.level() {
                Level::Error => "ERROR",
                Level::Warn => "WARN ",
                Level::Info => "INFO ",
                Level::Debug => "DEBUG",
                Level::Trace => "TRACE",
            }
        };

        let module = match record.module_path() {
            Some(module_path) if self.config.show_module => format!("[{}] ", module_path),
            _ => String::new(),
        };

        format!("{}{} {}{}", timestamp, level, module, record.args())
    }
}

/// 初始化日志系统，只能调用一次
pub fn init_logger(config: LogConfig) -> Result<(), String> {
    let file = match config.file_path() {
        Some(path) => {
            let file = open_log_file(path).map_err(|e| format!("无法创建日志文件 {}: {}", path.display(), e))?;
            Some(Mutex::new(file))
        }
        None => None,
    };

    let level = config.level;
    log::set_boxed_logger(Box::new(CustomLogger { config, file }))
        .map_err(|e| format!("设置日志器失败: {}", e))?;
    log::set_max_level(level);

    Ok(())
}
