#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

pub(crate) const MULTI_PATH_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "attach",
    action: "attach",
}];

pub(crate) const INDEX_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "remove",
    action: "remove_image",
}];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "images",
        action: "list_images",
    },
    CommandSpec {
        command: "cancel",
        action: "cancel",
    },
    CommandSpec {
        command: "reset",
        action: "reset_history",
    },
    CommandSpec {
        command: "session",
        action: "session_info",
    },
    CommandSpec {
        command: "stats",
        action: "stats",
    },
    CommandSpec {
        command: "history",
        action: "live_history",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "exit",
        action: "exit",
    },
    CommandSpec {
        command: "quit",
        action: "exit",
    },
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/attach",
    "/remove",
    "/images",
    "/cancel",
    "/reset",
    "/session",
    "/stats",
    "/history",
    "/help",
    "/exit",
];
