use crate::builtin::default_factories;
use crate::command::{CommandFactory, ExecutableCommand, ExitCode};
use crate::env::Environment;
use crate::job::JobControl;
use crate::lexer::split_into_tokens;
use crate::parser::{CommandLine, construct_command};
use crate::telemetry::{CpuReading, LoadCell};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::io::{self, BufRead, Write};
use std::path::Path;
use tracing::debug;

/// Prompt text: working directory (or `sh` when it cannot be read) and the
/// latest CPU reading.
pub fn render_prompt(cwd: Option<&Path>, load: CpuReading) -> String {
    match cwd {
        Some(dir) => format!("{} [{}]> ", dir.display(), load),
        None => format!("sh [{}]> ", load),
    }
}

/// Hint shown when Ctrl-C is pressed at the prompt.
const INTERRUPT_HINT: &str = "(use 'exit' to leave the shell)";

/// What the loop does with one result of the line editor.
#[derive(Debug)]
enum Step {
    Run(String),
    /// Ctrl-C at the prompt: the shell ignores interrupts for itself.
    Hint,
    Stop,
    Fail(ReadlineError),
}

fn next_step(read: rustyline::Result<String>) -> Step {
    match read {
        Ok(line) => Step::Run(line),
        Err(ReadlineError::Interrupted) => Step::Hint,
        Err(ReadlineError::Eof) => Step::Stop,
        Err(err) => Step::Fail(err),
    }
}

/// An interactive shell with job control.
///
/// The interpreter maintains an [`Environment`], a list of [`CommandFactory`]
/// objects for built-ins, and the [`JobControl`] engine that runs everything
/// else. Built-ins always win over programs of the same name.
pub struct Interpreter {
    env: Environment,
    commands: Vec<Box<dyn CommandFactory>>,
    jobs: JobControl,
    load: LoadCell,
}

impl Interpreter {
    /// Create a new interpreter with a custom set of built-in factories.
    pub fn new(commands: Vec<Box<dyn CommandFactory>>, jobs: JobControl, load: LoadCell) -> Self {
        Self {
            env: Environment::new(),
            commands,
            jobs,
            load,
        }
    }

    /// Interpreter with the standard built-ins.
    pub fn with_jobs(jobs: JobControl, load: LoadCell) -> Self {
        Self::new(default_factories(), jobs, load)
    }

    #[cfg(test)]
    pub(crate) fn env(&self) -> &Environment {
        &self.env
    }

    #[cfg(test)]
    pub(crate) fn jobs(&self) -> &JobControl {
        &self.jobs
    }

    fn builtin(&self, name: &str, args: &[&str]) -> Option<Box<dyn ExecutableCommand>> {
        self.commands
            .iter()
            .find_map(|factory| factory.try_create(name, args))
    }

    /// Parse and run one input line.
    ///
    /// `stdin` and `stdout` are only used by built-ins; jobs inherit the
    /// process's own descriptors.
    pub fn execute_line(
        &mut self,
        line: &str,
        stdin: &mut dyn BufRead,
        stdout: &mut dyn Write,
    ) -> anyhow::Result<ExitCode> {
        let tokens = split_into_tokens(line)?;
        match construct_command(tokens)? {
            CommandLine::Empty => Ok(0),
            CommandLine::Simple { argv, background } => {
                let Some((name, rest)) = argv.split_first() else {
                    return Ok(0);
                };
                let args: Vec<&str> = rest.iter().map(String::as_str).collect();
                if let Some(cmd) = self.builtin(name, &args) {
                    if background {
                        debug!(%name, "built-ins always run in the foreground");
                    }
                    return cmd.execute(stdin, stdout, &mut self.env);
                }
                let job = self.jobs.launch(&argv, background)?;
                Ok(job.status.exit_code())
            }
            CommandLine::Pipe { left, right } => {
                let (_, right) = self.jobs.connect(&left, &right)?;
                Ok(right.status.exit_code())
            }
        }
    }

    pub fn prompt(&mut self) -> String {
        let cwd = self.env.refresh_current_dir().cloned();
        render_prompt(cwd.as_deref(), self.load.snapshot())
    }

    /// Read-Eval-Print Loop. Returns on end of input or a confirmed `exit`;
    /// Ctrl-C at the prompt only prints a hint.
    pub fn repl(&mut self) -> rustyline::Result<()> {
        let mut rl = DefaultEditor::new()?;

        while !self.env.should_exit {
            let prompt = self.prompt();
            match next_step(rl.readline(&prompt)) {
                Step::Run(line) => {
                    if !line.trim().is_empty() {
                        rl.add_history_entry(line.as_str())?;
                    }
                    let stdin = io::stdin();
                    let mut stdout = io::stdout();
                    if let Err(e) = self.execute_line(&line, &mut stdin.lock(), &mut stdout) {
                        eprintln!("jobshell: {:#}", e);
                    }
                    stdout.flush()?;
                }
                Step::Hint => println!("{}", INTERRUPT_HINT),
                Step::Stop => break,
                Step::Fail(err) => return Err(err),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reaper::JobTable;
    use crate::terminal::Terminal;
    use crate::test_support::lock_current_dir;
    use std::io::Cursor;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    fn shell() -> Interpreter {
        Interpreter::with_jobs(
            JobControl::new(Terminal::detached(), JobTable::new()),
            LoadCell::default(),
        )
    }

    fn exec(sh: &mut Interpreter, line: &str) -> (anyhow::Result<ExitCode>, String) {
        let mut out = Vec::new();
        let res = sh.execute_line(line, &mut Cursor::new(b"n\n".to_vec()), &mut out);
        (res, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_prompt_shows_dir_and_load() {
        let dir = PathBuf::from("/home/user");
        assert_eq!(
            render_prompt(Some(dir.as_path()), CpuReading::Percent(42)),
            "/home/user [CPU 42%]> "
        );
        assert_eq!(
            render_prompt(Some(dir.as_path()), CpuReading::Unknown),
            "/home/user [CPU n/a]> "
        );
        assert_eq!(render_prompt(None, CpuReading::Unknown), "sh [CPU n/a]> ");
    }

    #[test]
    fn test_prompt_without_telemetry_is_unknown() {
        let _lock = lock_current_dir();
        let mut sh = shell();
        assert!(sh.prompt().ends_with(" [CPU n/a]> "));
    }

    #[test]
    fn test_ctrl_c_at_prompt_keeps_shell_running() {
        assert!(matches!(next_step(Err(ReadlineError::Interrupted)), Step::Hint));
        assert!(matches!(next_step(Err(ReadlineError::Eof)), Step::Stop));
        assert!(matches!(
            next_step(Ok("ls -l".to_string())),
            Step::Run(line) if line == "ls -l"
        ));
        assert!(matches!(
            next_step(Err(ReadlineError::Io(io::Error::other("tty gone")))),
            Step::Fail(_)
        ));
    }

    #[test]
    fn test_blank_line_does_nothing() {
        let mut sh = shell();
        let (res, out) = exec(&mut sh, "   ");
        assert_eq!(res.unwrap(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_builtin_takes_precedence() {
        let _lock = lock_current_dir();
        let mut sh = shell();
        let (res, out) = exec(&mut sh, "pwd");
        assert_eq!(res.unwrap(), 0);
        assert_eq!(out.trim_end(), sh.env().current_dir.to_string_lossy());
    }

    #[test]
    fn test_exit_is_cancelled_without_y() {
        let mut sh = shell();
        let (res, out) = exec(&mut sh, "exit");
        assert_eq!(res.unwrap(), 0);
        assert!(out.contains("Exit cancelled."));
        assert!(!sh.env().should_exit);

        let mut out = Vec::new();
        sh.execute_line("exit", &mut Cursor::new(b"y\n".to_vec()), &mut out)
            .unwrap();
        assert!(sh.env().should_exit);
    }

    #[test]
    fn test_external_exit_code_propagates() {
        let mut sh = shell();
        let (res, _) = exec(&mut sh, "sh -c 'exit 4'");
        assert_eq!(res.unwrap(), 4);
        let (res, _) = exec(&mut sh, "no-such-program-qq");
        assert_eq!(res.unwrap(), 127);
    }

    #[test]
    fn test_pipe_reports_right_stage() {
        let mut sh = shell();
        let (res, _) = exec(&mut sh, "true | sh -c 'exit 6'");
        assert_eq!(res.unwrap(), 6);
    }

    #[test]
    fn test_background_returns_immediately() {
        let mut sh = shell();
        let start = Instant::now();
        let (res, _) = exec(&mut sh, "sleep 0.2 &");
        assert_eq!(res.unwrap(), 0);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(sh.jobs().table().len(), 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !sh.jobs().table().is_empty() && Instant::now() < deadline {
            sh.jobs().table().drain();
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(sh.jobs().table().is_empty());
    }

    #[test]
    fn test_syntax_errors_are_reported() {
        let mut sh = shell();
        for line in ["ls |", "| wc", "echo 'open", "a | b | c", "a & b"] {
            let (res, _) = exec(&mut sh, line);
            assert!(res.is_err(), "{line:?} should fail");
        }
    }
}
