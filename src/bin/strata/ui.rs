use std::fmt::Display;
use std::io::IsTerminal;

use nu_ansi_term::{Color, Style};

/// When to color output.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum Theme {
    /// Color when stdout is a terminal.
    Auto,
    /// Always color.
    Color,
    /// Never color.
    Plain,
}

struct Styles {
    title: Style,
    label: Style,
    marker: Style,
    alert: Style,
}

pub struct Ui {
    // `None` prints unstyled text.
    styles: Option<Styles>,
}

impl Ui {
    pub fn new(theme: Theme) -> Self {
        let paint = match theme {
            Theme::Plain => false,
            Theme::Color => true,
            Theme::Auto => std::io::stdout().is_terminal(),
        };
        #[cfg(windows)]
        if paint {
            let _ = nu_ansi_term::enable_ansi_support();
        }
        let styles = paint.then(|| Styles {
            title: Color::Cyan.bold(),
            label: Color::LightBlue.normal(),
            marker: Color::DarkGray.normal(),
            alert: Color::Yellow.bold(),
        });
        Self { styles }
    }

    fn paint(&self, pick: impl Fn(&Styles) -> Style, text: impl Display) -> String {
        match &self.styles {
            Some(styles) => pick(styles).paint(text.to_string()).to_string(),
            None => text.to_string(),
        }
    }

    fn title(&self, title: &str) {
        println!("{}", self.paint(|s| s.title, format_args!("== {title} ==")));
    }

    /// Aligned `label: value` rows under a title. Prints nothing for no rows.
    pub fn section<'a, I, V>(&self, title: &str, rows: I)
    where
        I: IntoIterator<Item = (&'a str, V)>,
        V: Display,
    {
        let rows: Vec<(&str, String)> = rows
            .into_iter()
            .map(|(label, value)| (label, value.to_string()))
            .collect();
        if rows.is_empty() {
            return;
        }
        self.title(title);
        let width = rows.iter().map(|(label, _)| label.len()).max().unwrap_or(0);
        for (label, value) in rows {
            let label = self.paint(|s| s.label, format_args!("{label:<width$}"));
            println!("  {label}  {value}");
        }
    }

    pub fn list<I>(&self, title: &str, entries: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.title(title);
        let mut empty = true;
        for entry in entries {
            empty = false;
            println!("  {} {entry}", self.paint(|s| s.marker, "-"));
        }
        if empty {
            println!("  {}", self.paint(|s| s.marker, "(none)"));
        }
    }

    pub fn info(&self, message: &str) {
        println!("{message}");
    }

    pub fn warn(&self, message: &str) {
        eprintln!("{} {message}", self.paint(|s| s.alert, "warning:"));
    }
}
