#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "use",
        action: "select_document",
    },
    CommandSpec {
        command: "remove",
        action: "remove_document",
    },
];

pub(crate) const PATH_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "attach",
        action: "attach_file",
    },
    CommandSpec {
        command: "export",
        action: "export_rows",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "docs",
        action: "list_documents",
    },
    CommandSpec {
        command: "columns",
        action: "show_columns",
    },
    CommandSpec {
        command: "summary",
        action: "show_summary",
    },
    CommandSpec {
        command: "analyze",
        action: "analyze_staged",
    },
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/attach",
    "/analyze",
    "/docs",
    "/use",
    "/remove",
    "/columns",
    "/summary",
    "/export",
    "/help",
];
