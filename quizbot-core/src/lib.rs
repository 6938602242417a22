// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

pub mod arith;
pub mod challenge;
pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod interpreter;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;
pub mod visual;
pub mod wire;
pub mod worker;

pub use challenge::ChallengeSolver;
pub use config::BotSettings;
pub use driver::{DriverFactory, DriverKind, SessionDriver};
pub use error::BotError;
pub use events::EventSink;
pub use registry::{BotConfig, BotRegistry};
pub use session::{HttpSessionResolver, SessionSource};
pub use transport::WebSocketConnector;
pub use wire::WireDriverFactory;
