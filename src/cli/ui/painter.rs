use owo_colors::{OwoColorize, Style as OwoStyle};

/// Styles terminal output, or passes text through when colour is off.
#[derive(Debug)]
pub(crate) struct Painter {
    use_colour: bool,
}

impl Painter {
    pub(crate) fn new(use_colour: bool) -> Self {
        Self { use_colour }
    }

    pub(crate) fn heading<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().bold().cyan())
    }

    pub(crate) fn success<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().bold().green())
    }

    pub(crate) fn warning<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().bold().yellow())
    }

    pub(crate) fn muted<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().dimmed())
    }

    pub(crate) fn value<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().bold())
    }

    fn paint(&self, text: &str, style: OwoStyle) -> String {
        if self.use_colour {
            format!("{}", text.style(style))
        } else {
            text.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    type Style = fn(&Painter, &str) -> String;

    #[rstest]
    #[case::heading(|painter: &Painter, text: &str| painter.heading(text))]
    #[case::success(|painter: &Painter, text: &str| painter.success(text))]
    #[case::warning(|painter: &Painter, text: &str| painter.warning(text))]
    #[case::muted(|painter: &Painter, text: &str| painter.muted(text))]
    #[case::value(|painter: &Painter, text: &str| painter.value(text))]
    fn colour_is_only_applied_when_enabled(#[case] style: Style) {
        let plain = style(&Painter::new(false), "dfb1");
        let coloured = style(&Painter::new(true), "dfb1");

        assert_eq!("dfb1", plain);
        assert_ne!(plain, coloured);
        assert!(coloured.contains("dfb1"));
    }
}
