/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */


mod list;
mod server;

use crate::kubemirror::logger;
use crate::kubemirror::util::error::BoxError;

use super::args::{Commands, KubeMirror};

pub async fn run(cli: &KubeMirror) -> Result<(), BoxError> {
    logger::set_log_format(cli.log_format.into());
    logger::set_level_filter(cli.log_level.into());
    match &cli.command {
        Commands::Server(args) => server::handle_server(args).await,
        Commands::List(args) => list::handle_list(args).await,
    }
}
